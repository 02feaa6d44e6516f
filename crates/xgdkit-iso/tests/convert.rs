//! End-to-end conversions over a small authored game tree.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use xgdkit_iso::cancel::CancelToken;
use xgdkit_iso::extract::Extractor;
use xgdkit_iso::read::ImageReader;
use xgdkit_iso::title::TitleHelper;
use xgdkit_iso::write::cci::CciWriter;
use xgdkit_iso::write::cso::CsoWriter;
use xgdkit_iso::write::god::GodWriter;
use xgdkit_iso::write::xiso::XisoWriter;
use xgdkit_iso::ScrubType;

const SECTOR: usize = 2048;

/// A minimal XEX2 with an execution info record, enough for the certificate
/// reader.
fn fake_xex() -> Vec<u8> {
    let mut image = vec![0u8; 0x400];
    image[0..4].copy_from_slice(b"XEX2");
    image[0x14..0x18].copy_from_slice(&1u32.to_be_bytes()); // header count
    image[0x18..0x1C].copy_from_slice(&0x0004_0006u32.to_be_bytes());
    image[0x1C..0x20].copy_from_slice(&0x200u32.to_be_bytes());
    // Execution info at 0x200.
    image[0x200..0x204].copy_from_slice(&0x1122_3344u32.to_be_bytes()); // media id
    image[0x20C..0x210].copy_from_slice(&0x4156_004Fu32.to_be_bytes()); // title id
    image[0x212] = 1; // disc number
    image[0x213] = 1; // disc count
    image
}

fn lcg_bytes(len: usize, mut state: u32) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

/// `{A/b, A/c, d.bin, noise.bin, E/, default.xex}` on the host filesystem.
fn build_game_tree(root: &Path) {
    std::fs::create_dir_all(root.join("A")).unwrap();
    std::fs::create_dir_all(root.join("E")).unwrap();
    std::fs::write(root.join("A/b"), lcg_bytes(1000, 7).repeat(1)).unwrap();
    std::fs::write(root.join("A/c"), vec![0x5A; 3000]).unwrap();
    std::fs::write(root.join("d.bin"), vec![0xAB; 4096]).unwrap();
    std::fs::write(root.join("noise.bin"), lcg_bytes(SECTOR, 99)).unwrap();
    std::fs::write(root.join("default.xex"), fake_xex()).unwrap();
}

fn author_xiso(game: &Path, out: &Path) -> PathBuf {
    let paths = XisoWriter::from_dir(game, false)
        .convert(out, &CancelToken::new())
        .unwrap();
    assert_eq!(paths.len(), 1);
    paths.into_iter().next().unwrap()
}

#[test]
fn authored_xiso_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let bytes = std::fs::read(&iso).unwrap();
    assert_eq!(bytes.len() % 0x10000, 0);
    assert_eq!(&bytes[31337..31337 + 8], b"in!xgdt!");
    assert_eq!(&bytes[0x10000..0x10014], b"MICROSOFT*XBOX*MEDIA");
    let root_sector = u32::from_le_bytes(bytes[0x10014..0x10018].try_into().unwrap());
    assert_eq!(root_sector, 0x108);

    let mut reader = ImageReader::open_xiso(&[&iso]).unwrap();
    let entries = reader.directory_entries().unwrap().to_vec();
    let paths: Vec<String> = entries
        .iter()
        .map(|e| e.path.to_string_lossy().into_owned())
        .collect();
    // Directories first, then files by path.
    assert_eq!(paths, ["A", "E", "A/b", "A/c", "d.bin", "default.xex", "noise.bin"]);

    // The empty directory occupies exactly one sector of pad bytes.
    let empty = entries.iter().find(|e| e.filename == "E").unwrap();
    assert!(empty.header.is_directory());
    assert_eq!(empty.header.file_size.get(), 2048);
    let table_offset = empty.header.start_sector.get() as usize * SECTOR;
    assert!(bytes[table_offset..table_offset + SECTOR]
        .iter()
        .all(|&b| b == 0xFF));

    // Everything outside the header, tables and file data is zero or pad.
    assert_eq!(reader.total_sectors() as usize, bytes.len() / SECTOR);
}

#[test]
fn extraction_matches_source() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let mut reader = ImageReader::open_xiso(&[&iso]).unwrap();
    let out = dir.path().join("extracted");
    Extractor::new(&mut reader)
        .extract(&out, &CancelToken::new())
        .unwrap();

    for file in ["A/b", "A/c", "d.bin", "noise.bin", "default.xex"] {
        assert_eq!(
            std::fs::read(out.join(file)).unwrap(),
            std::fs::read(game.join(file)).unwrap(),
            "{file} mismatch"
        );
    }
    assert!(out.join("E").is_dir());
}

#[test]
fn full_scrub_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let first = author_xiso(&game, &dir.path().join("out/first.iso"));

    let mut reader = ImageReader::open_xiso(&[&first]).unwrap();
    let second = XisoWriter::from_reader(&mut reader, ScrubType::Full, false)
        .convert(&dir.path().join("out/second.iso"), &CancelToken::new())
        .unwrap();
    let mut reader = ImageReader::open_xiso(&[&second[0]]).unwrap();
    let third = XisoWriter::from_reader(&mut reader, ScrubType::Full, false)
        .convert(&dir.path().join("out/third.iso"), &CancelToken::new())
        .unwrap();

    assert_eq!(
        std::fs::read(&second[0]).unwrap(),
        std::fs::read(&third[0]).unwrap()
    );
}

#[test]
fn partial_scrub_preserves_content() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let mut reader = ImageReader::open_xiso(&[&iso]).unwrap();
    let scrubbed = XisoWriter::from_reader(&mut reader, ScrubType::Partial, false)
        .convert(&dir.path().join("out/scrubbed.iso"), &CancelToken::new())
        .unwrap();

    let mut reader = ImageReader::open_xiso(&[&scrubbed[0]]).unwrap();
    let out = dir.path().join("extracted");
    Extractor::new(&mut reader)
        .extract(&out, &CancelToken::new())
        .unwrap();
    for file in ["A/b", "A/c", "d.bin", "noise.bin", "default.xex"] {
        assert_eq!(
            std::fs::read(out.join(file)).unwrap(),
            std::fs::read(game.join(file)).unwrap(),
            "{file} mismatch"
        );
    }
}

#[test]
fn cci_round_trips_sector_for_sector() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let mut source = ImageReader::open_xiso(&[&iso]).unwrap();
    let cci_paths = CciWriter::from_reader(&mut source, ScrubType::Full)
        .convert(&dir.path().join("out/game.cci"), &CancelToken::new())
        .unwrap();
    assert_eq!(cci_paths.len(), 1);

    let mut cci = ImageReader::open_cci(&cci_paths).unwrap();
    assert_eq!(cci.total_sectors(), source.total_sectors());
    let mut expected = vec![0u8; SECTOR];
    let mut actual = vec![0u8; SECTOR];
    for sector in 0..source.total_sectors() {
        source.read_sector(sector, &mut expected).unwrap();
        cci.read_sector(sector, &mut actual).unwrap();
        assert_eq!(expected, actual, "sector {sector} differs");
    }
}

#[test]
fn cci_index_flags_compressed_and_stored_records() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let mut source = ImageReader::open_xiso(&[&iso]).unwrap();
    let cci_paths = CciWriter::from_reader(&mut source, ScrubType::Full)
        .convert(&dir.path().join("out/game.cci"), &CancelToken::new())
        .unwrap();

    let entries = source.directory_entries().unwrap().to_vec();
    let sector_of = |name: &str| {
        entries
            .iter()
            .find(|e| e.filename == name)
            .unwrap()
            .header
            .start_sector
            .get()
    };

    let cci_bytes = std::fs::read(&cci_paths[0]).unwrap();
    assert_eq!(&cci_bytes[0..4], b"CCIM");
    let index_offset =
        u64::from_le_bytes(cci_bytes[16..24].try_into().unwrap()) as usize;
    let index_word = |sector: u32| {
        let at = index_offset + sector as usize * 4;
        u32::from_le_bytes(cci_bytes[at..at + 4].try_into().unwrap())
    };

    // A run of 0xAB compresses; LCG noise does not.
    assert_ne!(index_word(sector_of("d.bin")) & 0x8000_0000, 0);
    assert_eq!(index_word(sector_of("noise.bin")) & 0x8000_0000, 0);
}

#[test]
fn cso_round_trips_sector_for_sector() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let mut source = ImageReader::open_xiso(&[&iso]).unwrap();
    let cso_paths = CsoWriter::from_reader(&mut source, ScrubType::Full)
        .convert(&dir.path().join("out/game.cso"), &CancelToken::new())
        .unwrap();
    assert_eq!(cso_paths.len(), 1);

    let mut cso = ImageReader::open_cso(&cso_paths).unwrap();
    assert_eq!(cso.total_sectors(), source.total_sectors());
    let mut expected = vec![0u8; SECTOR];
    let mut actual = vec![0u8; SECTOR];
    for sector in 0..source.total_sectors() {
        source.read_sector(sector, &mut expected).unwrap();
        cso.read_sector(sector, &mut actual).unwrap();
        assert_eq!(expected, actual, "sector {sector} differs");
    }
}

/// Checks the whole hash tree of one Data part and returns the master-table
/// hash.
fn verify_god_part(path: &Path) -> Vec<u8> {
    let data = std::fs::read(path).unwrap();
    assert_eq!(data.len() % 0x1000, 0, "part not block-aligned");
    let blocks = data.len() / 0x1000;
    let group = 205; // one sub-hashtable fronting 204 data blocks
    let sub_hashtables = (blocks - 1).div_ceil(group);
    let mut blocks_left = blocks - 1;

    for sht in 0..sub_hashtables {
        let sht_offset = (sht * group + 1) * 0x1000;
        blocks_left -= 1;
        let data_blocks = blocks_left.min(204);
        for i in 0..data_blocks {
            let block_offset = sht_offset + 0x1000 + i * 0x1000;
            let digest = Sha1::digest(&data[block_offset..block_offset + 0x1000]);
            assert_eq!(
                &data[sht_offset + i * 20..sht_offset + i * 20 + 20],
                digest.as_slice(),
                "data block hash mismatch (sht {sht}, block {i})"
            );
        }
        blocks_left -= data_blocks;

        let sht_digest = Sha1::digest(&data[sht_offset..sht_offset + 0x1000]);
        assert_eq!(
            &data[sht * 20..sht * 20 + 20],
            sht_digest.as_slice(),
            "sub-hashtable hash mismatch (sht {sht})"
        );
    }
    Sha1::digest(&data[0..0x1000]).to_vec()
}

#[test]
fn god_output_hash_tree_and_header_are_valid() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let mut source = ImageReader::open_xiso(&[&iso]).unwrap();
    let title = TitleHelper::from_reader(&mut source, None).unwrap();
    let out_dir = dir.path().join("god");
    GodWriter::from_reader(&mut source, &title, ScrubType::Full)
        .convert(&out_dir, &CancelToken::new())
        .unwrap();

    // Xbox 360 content lands under the Games-on-Demand type directory.
    let type_dir = out_dir.join("00007000");
    let data_dir = type_dir.join(format!("{}.data", title.unique_name()));
    let part = data_dir.join("Data0000");
    assert!(part.is_file());
    let master_hash = verify_god_part(&part);

    let live = std::fs::read(type_dir.join(title.unique_name())).unwrap();
    assert_eq!(live.len(), 0xB000);
    assert_eq!(&live[0x344..0x348], &[0x00, 0x00, 0x70, 0x00]);
    assert_eq!(&live[0x37D..0x37D + 20], master_hash.as_slice());
    // Media and title ids are copied big-endian from the execution info.
    assert_eq!(&live[0x354..0x358], &0x1122_3344u32.to_be_bytes());
    assert_eq!(&live[0x360..0x364], &0x4156_004Fu32.to_be_bytes());
    assert_eq!(&live[0x3A0..0x3A4], &1u32.to_le_bytes());
    let header_digest = Sha1::digest(&live[0x344..]);
    assert_eq!(&live[0x32C..0x32C + 20], header_digest.as_slice());
}

#[test]
fn god_reader_returns_the_original_sectors() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    let mut source = ImageReader::open_xiso(&[&iso]).unwrap();
    let title = TitleHelper::from_reader(&mut source, None).unwrap();
    let out_dir = dir.path().join("god");
    GodWriter::from_reader(&mut source, &title, ScrubType::Full)
        .convert(&out_dir, &CancelToken::new())
        .unwrap();

    let mut god = ImageReader::open_god(&out_dir).unwrap();
    assert!(god.total_sectors() >= source.total_sectors());
    let mut expected = vec![0u8; SECTOR];
    let mut actual = vec![0u8; SECTOR];
    for sector in 0..source.total_sectors() {
        source.read_sector(sector, &mut expected).unwrap();
        god.read_sector(sector, &mut actual).unwrap();
        assert_eq!(expected, actual, "sector {sector} differs");
    }
    // The walked tree is identical too.
    let source_entries: Vec<_> = source
        .directory_entries()
        .unwrap()
        .iter()
        .map(|e| (e.path.clone(), e.header.file_size.get()))
        .collect();
    let god_entries: Vec<_> = god
        .directory_entries()
        .unwrap()
        .iter()
        .map(|e| (e.path.clone(), e.header.file_size.get()))
        .collect();
    assert_eq!(source_entries, god_entries);
}

#[test]
fn xiso_from_dir_and_from_entries_produce_the_same_tree() {
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("game");
    build_game_tree(&game);
    let iso = author_xiso(&game, &dir.path().join("out/game.iso"));

    // Authoring again from the read-back entry list keeps every offset: the
    // two construction paths converge on the same plan.
    let mut reader = ImageReader::open_xiso(&[&iso]).unwrap();
    let rebuilt = XisoWriter::from_reader(&mut reader, ScrubType::Full, false)
        .convert(&dir.path().join("out/rebuilt.iso"), &CancelToken::new())
        .unwrap();
    let original = std::fs::read(&iso).unwrap();
    let rebuilt = std::fs::read(&rebuilt[0]).unwrap();
    assert_eq!(original.len(), rebuilt.len());
    assert_eq!(original, rebuilt);
}
