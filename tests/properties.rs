use std::collections::{BTreeSet, HashSet};
use std::io::Cursor;

use proptest::prelude::*;

use mpqkit::consts::*;
use mpqkit::{Archive, CreateOptions, FileOptions, OpenOptions};

fn options() -> impl Strategy<Value = FileOptions> {
    (
        any::<bool>(),
        prop::sample::select(vec![0, COMPRESSION_ZLIB, COMPRESSION_BZIP2]),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(compress, compression, encrypt, fix_key, single_unit, sector_crc)| FileOptions {
                compress,
                compression,
                encrypt,
                fix_key,
                single_unit,
                sector_crc,
                ..FileOptions::default()
            },
        )
}

fn collect_found(archive: &Archive<&mut Cursor<Vec<u8>>>) -> Vec<String> {
    match archive.find_first("*", None) {
        Ok((finder, first)) => std::iter::once(first)
            .chain(finder)
            .map(|found| found.name)
            .filter(|name| !name.starts_with('('))
            .collect(),
        Err(error) => {
            assert!(error.is_not_found());
            Vec::new()
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn files_read_back_as_written(
        data in prop::collection::vec(any::<u8>(), 0..20_000),
        options in options(),
        sector_size_shift in 0u16..4,
    ) {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut archive = CreateOptions::new()
                .sector_size_shift(sector_size_shift)
                .create(&mut buf)
                .unwrap();
            archive.add_file("Data\\payload.bin", &data, options).unwrap();
            archive.close().unwrap();
        }

        let archive = OpenOptions::new()
            .check_sector_crc(true)
            .open(&mut buf)
            .unwrap();
        prop_assert_eq!(archive.read_file("data/PAYLOAD.bin").unwrap(), data);
    }

    #[test]
    fn every_inserted_name_is_found(
        names in prop::collection::hash_set("[a-z0-9_]{1,12}\\.(txt|mdx|blp)", 1..60),
        removed in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let mut buf = Cursor::new(Vec::new());
        let mut archive = CreateOptions::new()
            .max_file_count(names.len())
            .create(&mut buf)
            .unwrap();

        for name in &names {
            archive.add_file(name, name.as_bytes(), FileOptions::default()).unwrap();
        }

        let removed: HashSet<&String> = removed.iter().map(|index| index.get(&names)).collect();
        for name in &removed {
            archive.remove_file(name, LOCALE_NEUTRAL).unwrap();
        }

        for name in &names {
            if removed.contains(name) {
                prop_assert!(!archive.has_file(name).unwrap());
            } else {
                prop_assert_eq!(archive.read_file(name).unwrap(), name.as_bytes());
            }
        }

        let expected: BTreeSet<String> = names
            .iter()
            .filter(|name| !removed.contains(name))
            .cloned()
            .collect();
        let found = collect_found(&archive);
        prop_assert_eq!(found.len(), expected.len());
        prop_assert_eq!(found.into_iter().collect::<BTreeSet<_>>(), expected);
    }
}
