// Basic lifecycle: format, write, read back, list, remount.

use pifs::{Pifs, SeekFrom};
use simflash::gen::PatternBuilder;
use simflash::styles::M25P80;
use simflash::SimFlash;

fn fresh() -> Pifs<SimFlash> {
    let _ = env_logger::builder().is_test(true).try_init();
    let flash = M25P80.build().unwrap();
    let mut fs = Pifs::new(flash);
    fs.init().unwrap();
    fs
}

#[test]
fn format_reports_free_space() {
    let mut fs = fresh();
    let space = fs.get_free_space().unwrap();
    // 16 blocks minus the two management areas, 256 pages of 256 bytes.
    assert_eq!(space.data_pages, 14 * 256);
    assert_eq!(space.data_bytes, 14 * 256 * 256);
    assert!(space.management_pages > 0);

    let tbr = fs.get_to_be_released_space().unwrap();
    assert_eq!(tbr.data_pages, 0);
}

#[test]
fn write_read_round_trip() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(768).seed(0).sequence();

    let file = fs.open("test.dat", "w").unwrap();
    assert_eq!(fs.write(file, &data).unwrap(), 768);
    assert_eq!(fs.tell(file).unwrap(), 768);
    fs.close(file).unwrap();

    let file = fs.open("test.dat", "r").unwrap();
    assert_eq!(fs.file_size(file).unwrap(), 768);
    let mut back = vec![0u8; 768];
    assert_eq!(fs.read(file, &mut back).unwrap(), 768);
    assert_eq!(back, data);
    assert_eq!(fs.tell(file).unwrap(), 768);
    assert!(fs.eof(file).unwrap());
    // Reading past the end returns a zero count.
    assert_eq!(fs.read(file, &mut back).unwrap(), 0);
    fs.close(file).unwrap();
}

#[test]
fn directory_listing_matches_files() {
    let mut fs = fresh();
    let names = ["test.dat", "test2.dat", "test.dat3"];
    for (i, name) in names.iter().enumerate() {
        let data = PatternBuilder::default().size(768).seed(i as u64 + 1).random();
        let file = fs.open(name, "w").unwrap();
        assert_eq!(fs.write(file, &data).unwrap(), 768);
        fs.close(file).unwrap();
    }

    let dir = fs.opendir("/").unwrap();
    let mut listed = Vec::new();
    while let Some(entry) = fs.readdir(dir).unwrap() {
        assert_eq!(entry.file_size, 768);
        listed.push(entry.name.as_str().to_string());
    }
    fs.closedir(dir).unwrap();

    listed.sort();
    let mut expected: Vec<_> = names.iter().map(|s| s.to_string()).collect();
    expected.sort();
    assert_eq!(listed, expected);
}

#[test]
fn contents_survive_remount() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(4000).seed(9).random();

    let file = fs.open("persist.bin", "w").unwrap();
    assert_eq!(fs.write(file, &data).unwrap(), data.len());
    fs.close(file).unwrap();
    let counter = fs.header_counter();

    fs.delete().unwrap();
    fs.init().unwrap();
    assert_eq!(fs.header_counter(), counter);

    let file = fs.open("persist.bin", "r").unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(fs.read(file, &mut back).unwrap(), data.len());
    assert_eq!(back, data);
    fs.close(file).unwrap();
}

#[test]
fn seek_and_tell() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(1000).seed(3).random();
    let file = fs.open("seek.bin", "w+").unwrap();
    fs.write(file, &data).unwrap();

    fs.seek(file, SeekFrom::Start(100)).unwrap();
    assert_eq!(fs.tell(file).unwrap(), 100);
    let mut byte = [0u8; 1];
    fs.read(file, &mut byte).unwrap();
    assert_eq!(byte[0], data[100]);

    fs.seek(file, SeekFrom::Current(-1)).unwrap();
    assert_eq!(fs.tell(file).unwrap(), 100);

    fs.seek(file, SeekFrom::End(-1)).unwrap();
    fs.read(file, &mut byte).unwrap();
    assert_eq!(byte[0], data[999]);
    fs.close(file).unwrap();
}

#[test]
fn check_passes_on_healthy_filesystem() {
    let mut fs = fresh();
    for i in 0..5u64 {
        let data = PatternBuilder::default().size(2048).seed(i).random();
        let mut name = String::from("file");
        name.push((b'a' + i as u8) as char);
        let file = fs.open(&name, "w").unwrap();
        fs.write(file, &data).unwrap();
        fs.close(file).unwrap();
    }
    fs.remove("filec").unwrap();
    fs.check().unwrap();
}
