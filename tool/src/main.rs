use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{
    app_from_crate, crate_authors, crate_description, crate_name, crate_version, AppSettings, Arg,
    ArgMatches, SubCommand,
};
use log::{info, warn};

use mpqkit::{
    Archive, CreateOptions, ErrorKind, FileFindData, FileOptions, FormatVersion, OpenOptions,
    SearchScope, SignatureKeys, VerifyFlags,
};

type CommandResult = Result<(), Box<dyn Error>>;

fn archive_arg(help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name("archive")
        .index(1)
        .value_name("archive")
        .help(help)
        .takes_value(true)
        .required(true)
}

fn listfile_arg() -> Arg<'static, 'static> {
    Arg::with_name("listfile")
        .value_name("file")
        .long("listfile")
        .short("l")
        .help("external listfile with names the archive does not know")
        .takes_value(true)
}

fn main() {
    env_logger::init();

    let matches = app_from_crate!()
        .setting(AppSettings::SubcommandRequired)
        .setting(AppSettings::DisableHelpSubcommand)
        .setting(AppSettings::GlobalVersion)
        .setting(AppSettings::ColorNever)
        .subcommand(
            SubCommand::with_name("list")
                .about("lists files in an archive")
                .arg(archive_arg("archive file to list"))
                .arg(
                    Arg::with_name("mask")
                        .value_name("pattern")
                        .long("mask")
                        .short("m")
                        .help("only list files matching this wildcard mask")
                        .default_value("*")
                        .takes_value(true),
                )
                .arg(listfile_arg()),
        )
        .subcommand(
            SubCommand::with_name("extract")
                .about("extracts files from an archive")
                .arg(archive_arg("archive file to extract from"))
                .arg(
                    Arg::with_name("output")
                        .value_name("dir")
                        .short("o")
                        .long("output")
                        .help("directory where to output extracted files")
                        .default_value("./")
                        .takes_value(true)
                )
                .arg(
                    Arg::with_name("filter")
                        .value_name("pattern")
                        .long("filter")
                        .short("f")
                        .help("if specified, will only extract files which match the specified wildcard mask")
                        .takes_value(true)
                )
                .arg(listfile_arg()),
        )
        .subcommand(
            SubCommand::with_name("view")
                .about("views a single file in an archive")
                .arg(archive_arg("archive file to view from"))
                .arg(
                    Arg::with_name("file")
                        .index(2)
                        .value_name("filename")
                        .help("file inside the archive to view")
                        .takes_value(true)
                        .required(true)
                )
        )
        .subcommand(
            SubCommand::with_name("create")
                .about("creates an archive from files and directories")
                .arg(archive_arg("archive file to create"))
                .arg(
                    Arg::with_name("input")
                        .index(2)
                        .value_name("path")
                        .help("files or directories to add")
                        .takes_value(true)
                        .multiple(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("v2")
                        .long("v2")
                        .help("write a format v2 archive"),
                )
                .arg(
                    Arg::with_name("attributes")
                        .long("attributes")
                        .short("a")
                        .help("record CRC32, MD5 and timestamps in (attributes)"),
                )
                .arg(
                    Arg::with_name("encrypt")
                        .long("encrypt")
                        .short("e")
                        .help("encrypt added files"),
                ),
        )
        .subcommand(
            SubCommand::with_name("compact")
                .about("reclaims space left by removed and replaced files")
                .arg(archive_arg("archive file to compact"))
                .arg(listfile_arg()),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("checks files against their checksums and reports signatures")
                .arg(archive_arg("archive file to verify")),
        )
        .get_matches_safe();

    let result = match matches {
        Err(error) => error.exit(),
        Ok(matches) => match matches.subcommand() {
            ("list", Some(matches)) => command_list(matches),
            ("extract", Some(matches)) => command_extract(matches),
            ("view", Some(matches)) => command_view(matches),
            ("create", Some(matches)) => command_create(matches),
            ("compact", Some(matches)) => command_compact(matches),
            ("verify", Some(matches)) => command_verify(matches),
            (cmd, _) => {
                eprintln!("Unknown subcommand {} encountered", cmd);
                std::process::exit(1)
            }
        },
    };

    if let Err(error) = result {
        eprintln!("error: {}", error);
        std::process::exit(1)
    }
}

fn open_read_only(path: &str) -> Result<Archive<fs::File>, mpqkit::Error> {
    OpenOptions::new().read_only(true).open_path(path)
}

fn find_all(
    archive: &Archive<fs::File>,
    mask: &str,
    listfile: Option<&Path>,
) -> Result<Vec<FileFindData>, mpqkit::Error> {
    match archive.find_first(mask, listfile) {
        Ok((finder, first)) => Ok(std::iter::once(first).chain(finder).collect()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(error) => Err(error),
    }
}

fn command_list(matches: &ArgMatches) -> CommandResult {
    let archive = open_read_only(matches.value_of("archive").unwrap())?;
    let mask = matches.value_of("mask").unwrap_or("*");
    let listfile = matches.value_of("listfile").map(Path::new);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for found in find_all(&archive, mask, listfile)? {
        writeln!(
            out,
            "{:>10} {:>10} {:08x} {}",
            found.file_size, found.compressed_size, found.flags, found.name
        )?;
    }

    Ok(())
}

fn command_extract(matches: &ArgMatches) -> CommandResult {
    let mut archive = open_read_only(matches.value_of("archive").unwrap())?;
    let output = PathBuf::from(matches.value_of("output").unwrap_or("./"));
    let mask = matches.value_of("filter").unwrap_or("*");

    if let Some(listfile) = matches.value_of("listfile") {
        archive.add_listfile(listfile)?;
    }

    let mut extracted = 0;
    for found in find_all(&archive, mask, None)? {
        let dest = output.join(found.name.replace('\\', "/"));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match archive.extract_file(&found.name, &dest, SearchScope::Archive) {
            Ok(_) => extracted += 1,
            Err(error) => warn!("skipping {}: {}", found.name, error),
        }
    }

    info!("extracted {} files to {}", extracted, output.display());

    Ok(())
}

fn command_view(matches: &ArgMatches) -> CommandResult {
    let archive = open_read_only(matches.value_of("archive").unwrap())?;
    let data = archive.read_file(matches.value_of("file").unwrap())?;

    io::stdout().write_all(&data)?;

    Ok(())
}

fn collect_inputs(path: &Path, prefix: &str, files: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let prefix = if prefix.is_empty() {
                name
            } else {
                format!("{}\\{}", prefix, name)
            };

            collect_inputs(&entry.path(), &prefix, files)?;
        }
    } else {
        files.push((prefix.to_string(), path.to_path_buf()));
    }

    Ok(())
}

fn command_create(matches: &ArgMatches) -> CommandResult {
    let mut files = Vec::new();
    for input in matches.values_of("input").unwrap() {
        let path = Path::new(input);
        let name = if path.is_dir() {
            String::new()
        } else {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        collect_inputs(path, &name, &mut files)?;
    }

    let version = if matches.is_present("v2") {
        FormatVersion::V2
    } else {
        FormatVersion::V1
    };
    let mut archive = CreateOptions::new()
        .version(version)
        .max_file_count(files.len())
        .attributes(matches.is_present("attributes"))
        .create_path(matches.value_of("archive").unwrap())?;

    let options = FileOptions {
        compress: true,
        encrypt: matches.is_present("encrypt"),
        fix_key: matches.is_present("encrypt"),
        ..FileOptions::default()
    };
    for (name, path) in &files {
        archive.add_file(name, &fs::read(path)?, options)?;
    }
    archive.close()?;

    info!("added {} files", files.len());

    Ok(())
}

fn command_compact(matches: &ArgMatches) -> CommandResult {
    let mut archive = OpenOptions::new().open_path(matches.value_of("archive").unwrap())?;
    let before = archive.archive_size();

    archive.compact(matches.value_of("listfile").map(Path::new))?;
    println!("{} -> {} bytes", before, archive.archive_size());
    archive.close()?;

    Ok(())
}

fn command_verify(matches: &ArgMatches) -> CommandResult {
    let archive = open_read_only(matches.value_of("archive").unwrap())?;

    let mut failed = 0;
    for name in archive.files() {
        let result = archive.verify_file(&name, VerifyFlags::ALL)?;
        if !result.is_ok() {
            println!("FAILED {} {:?}", name, result);
            failed += 1;
        }
    }

    let signature = archive.verify(&SignatureKeys::default())?;
    println!("signature: {:?}", signature);

    if failed > 0 {
        return Err(format!("{} files failed verification", failed).into());
    }

    Ok(())
}
