/// Splits a listfile into names. Entries may be separated by CR, LF or
/// semicolons; blank entries are skipped.
pub(crate) fn parse(data: &[u8]) -> Vec<String> {
    data.split(|byte| *byte == b'\r' || *byte == b'\n' || *byte == b';')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Renders names as a CRLF-separated listfile, sorted and free of
/// case-insensitive duplicates.
pub(crate) fn render<'a, I>(names: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_by_key(|name| name.to_ascii_uppercase());
    names.dedup_by(|a, b| a.eq_ignore_ascii_case(b));

    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out
}
