use std::fs;
use std::io::SeekFrom;
use std::path::Path;

use tempfile::tempdir;

use mpqkit::consts::*;
use mpqkit::{
    Archive, CreateOptions, Error, ErrorKind, FileOptions, FileVerification, OpenOptions,
    VerifyFlags,
};

fn compressed() -> FileOptions {
    FileOptions {
        compress: true,
        ..FileOptions::default()
    }
}

fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x1234_5678u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn create_sample(path: &Path, test1: &[u8], test2: &[u8]) {
    let mut archive = CreateOptions::new()
        .max_file_count(128)
        .create_path(path)
        .unwrap();

    archive.add_file("test1.txt", test1, compressed()).unwrap();
    archive.add_file("test2.txt", test2, compressed()).unwrap();
    archive.close().unwrap();
}

#[test]
fn create_enumerate_seek_and_read() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.mpq");
    let test1 = b"0123456789".to_vec();
    let test2 = noise(16384);
    create_sample(&path, &test1, &test2);

    let archive = OpenOptions::new().read_only(true).open_path(&path).unwrap();

    let (mut finder, first) = archive.find_first("test*.txt", None).unwrap();
    let second = finder.find_next().unwrap();
    assert!(matches!(finder.find_next(), Err(Error::NoMoreFiles)));

    let mut found = vec![
        (first.name, first.file_size),
        (second.name, second.file_size),
    ];
    found.sort();
    assert_eq!(
        found,
        vec![
            ("test1.txt".to_string(), 10),
            ("test2.txt".to_string(), 16384)
        ]
    );

    let mut stream = archive.open_file("test1.txt").unwrap();
    assert_eq!(stream.set_position(SeekFrom::Start(1)).unwrap(), 1);
    assert_eq!(stream.set_position(SeekFrom::Current(1)).unwrap(), 2);
    assert_eq!(stream.position(), 2);

    stream.set_position(SeekFrom::Start(0)).unwrap();
    assert_eq!(stream.read_all().unwrap(), test1);
    assert_eq!(archive.read_file("test2.txt").unwrap(), test2);
}

#[test]
fn replacing_then_compacting_shrinks_the_archive() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.mpq");
    create_sample(&path, b"0123456789", &noise(16384));

    let mut archive = OpenOptions::new().open_path(&path).unwrap();
    let options = FileOptions {
        replace_existing: true,
        ..compressed()
    };
    archive
        .add_file("test2.txt", b"much smaller now", options)
        .unwrap();
    archive.flush().unwrap();

    let before = archive.archive_size();
    archive.compact(None).unwrap();
    let after = archive.archive_size();
    assert!(after < before, "{} is not smaller than {}", after, before);
    archive.close().unwrap();

    assert_eq!(fs::metadata(&path).unwrap().len(), after);

    let archive = Archive::open(fs::File::open(&path).unwrap()).unwrap();
    assert_eq!(archive.read_file("test1.txt").unwrap(), b"0123456789");
    assert_eq!(archive.read_file("test2.txt").unwrap(), b"much smaller now");
}

#[test]
fn compacting_a_tight_archive_keeps_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.mpq");
    let test2 = noise(16384);
    create_sample(&path, b"0123456789", &test2);

    let mut archive = OpenOptions::new().open_path(&path).unwrap();
    archive.compact(None).unwrap();
    let once = archive.archive_size();
    archive.compact(None).unwrap();
    assert!(archive.archive_size() <= once);

    assert_eq!(archive.read_file("test1.txt").unwrap(), b"0123456789");
    assert_eq!(archive.read_file("test2.txt").unwrap(), test2);
    assert_eq!(archive.files(), vec!["test1.txt", "test2.txt"]);
}

#[test]
fn encrypted_files_are_not_stored_in_the_clear() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("secret.mpq");
    let secret = b"PLAINTEXT-MARKER ".repeat(600);

    {
        let mut archive = Archive::create(
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .unwrap(),
        )
        .unwrap();
        let options = FileOptions {
            encrypt: true,
            fix_key: true,
            ..FileOptions::default()
        };
        archive.add_file("war3map.j", &secret, options).unwrap();
        archive.close().unwrap();
    }

    let raw = fs::read(&path).unwrap();
    assert!(!raw
        .windows(16)
        .any(|window| window == b"PLAINTEXT-MARKER"));

    let archive = OpenOptions::new().read_only(true).open_path(&path).unwrap();
    assert_eq!(archive.read_file("war3map.j").unwrap(), secret);
}

#[test]
fn corrupted_sectors_fail_their_checksum() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crc.mpq");
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    {
        // no listfile, so the file is the first thing after the header
        let mut archive = CreateOptions::new()
            .listfile(false)
            .create_path(&path)
            .unwrap();
        let options = FileOptions {
            sector_crc: true,
            ..compressed()
        };
        archive.add_file("units.slk", &data, options).unwrap();
        archive.close().unwrap();
    }

    let clean = OpenOptions::new()
        .read_only(true)
        .check_sector_crc(true)
        .open_path(&path)
        .unwrap();
    assert_eq!(clean.read_file("units.slk").unwrap(), data);
    drop(clean);

    // three sectors plus the checksum table: five offsets
    let mut raw = fs::read(&path).unwrap();
    let target = HEADER_SIZE_V1 as usize + 5 * 4 + 8;
    raw[target] ^= 0xFF;
    fs::write(&path, &raw).unwrap();

    let archive = OpenOptions::new()
        .read_only(true)
        .check_sector_crc(true)
        .open_path(&path)
        .unwrap();
    let error = archive.read_file("units.slk").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::CorruptSector);

    let result = archive.verify_file("units.slk", VerifyFlags::ALL).unwrap();
    assert!(result.contains(FileVerification::HAS_SECTOR_CRC | FileVerification::SECTOR_CRC_ERROR));
    assert!(!result.is_ok());
}

#[test]
fn removed_files_are_gone_after_reopening() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.mpq");
    create_sample(&path, b"0123456789", b"second");

    {
        let mut archive = OpenOptions::new().open_path(&path).unwrap();
        archive.remove_file("test1.txt", LOCALE_NEUTRAL).unwrap();
        assert_eq!(
            archive
                .remove_file("test1.txt", LOCALE_NEUTRAL)
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    let archive = OpenOptions::new().read_only(true).open_path(&path).unwrap();
    assert!(!archive.has_file("test1.txt").unwrap());
    assert_eq!(archive.files(), vec!["test2.txt"]);

    let listfile = archive.read_file(LISTFILE_NAME).unwrap();
    assert!(!String::from_utf8_lossy(&listfile).contains("test1.txt"));
}

#[test]
fn v2_archives_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v2.mpq");
    let data = noise(70_000);

    {
        let mut archive = CreateOptions::new()
            .version(mpqkit::FormatVersion::V2)
            .attributes(true)
            .create_path(&path)
            .unwrap();
        let options = FileOptions {
            compression: COMPRESSION_BZIP2,
            ..compressed()
        };
        archive.add_file("Sound\\Music.wav", &data, options).unwrap();
        archive.close().unwrap();
    }

    let archive = OpenOptions::new().read_only(true).open_path(&path).unwrap();
    assert_eq!(archive.format_version(), mpqkit::FormatVersion::V2);
    assert_eq!(archive.read_file("sound/music.wav").unwrap(), data);

    let result = archive
        .verify_file("Sound\\Music.wav", VerifyFlags::ALL)
        .unwrap();
    assert!(result.contains(FileVerification::HAS_CHECKSUM | FileVerification::HAS_MD5));
    assert!(result.is_ok());
}
