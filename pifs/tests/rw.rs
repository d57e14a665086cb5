// Read/write edge behavior: delta redirection, boundaries, modes, handles.

use pifs::{Error, Pifs, SeekFrom};
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

fn write_file(fs: &mut Pifs<SimFlash>, name: &str, data: &[u8]) {
    let file = fs.open(name, "w").unwrap();
    assert_eq!(fs.write(file, data).unwrap(), data.len());
    fs.close(file).unwrap();
}

fn read_file(fs: &mut Pifs<SimFlash>, name: &str) -> Vec<u8> {
    let file = fs.open(name, "r").unwrap();
    let size = fs.file_size(file).unwrap() as usize;
    let mut data = vec![0u8; size];
    assert_eq!(fs.read(file, &mut data).unwrap(), size);
    fs.close(file).unwrap();
    data
}

#[test]
fn overwrite_goes_through_delta() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(768).seed(1).random();
    write_file(&mut fs, "a.bin", &data);
    assert_eq!(fs.delta_entry_count().unwrap(), 0);

    let released_before = fs.get_to_be_released_space().unwrap().data_pages;

    let file = fs.open("a.bin", "r+").unwrap();
    let patch = [0x5au8; 256];
    fs.seek(file, SeekFrom::Start(0)).unwrap();
    assert_eq!(fs.write(file, &patch).unwrap(), 256);
    fs.close(file).unwrap();

    assert_eq!(fs.delta_entry_count().unwrap(), 1);
    // The replaced page is garbage now.
    let released_after = fs.get_to_be_released_space().unwrap().data_pages;
    assert_eq!(released_after, released_before + 1);

    let back = read_file(&mut fs, "a.bin");
    assert_eq!(&back[..256], &patch[..]);
    assert_eq!(&back[256..], &data[256..]);
}

#[test]
fn append_at_page_boundary_needs_no_delta() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(512).seed(2).random();
    write_file(&mut fs, "b.bin", &data);

    let file = fs.open("b.bin", "r+").unwrap();
    fs.seek(file, SeekFrom::End(0)).unwrap();
    let tail = [0x11u8; 100];
    assert_eq!(fs.write(file, &tail).unwrap(), 100);
    fs.close(file).unwrap();

    assert_eq!(fs.delta_entry_count().unwrap(), 0);
    let back = read_file(&mut fs, "b.bin");
    assert_eq!(back.len(), 612);
    assert_eq!(&back[512..], &tail[..]);
}

#[test]
fn one_byte_before_eof_makes_one_delta() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(768).seed(3).random();
    write_file(&mut fs, "c.bin", &data);

    let file = fs.open("c.bin", "r+").unwrap();
    fs.seek(file, SeekFrom::Start(767)).unwrap();
    assert_eq!(fs.write(file, &[0xee]).unwrap(), 1);
    fs.close(file).unwrap();

    assert_eq!(fs.delta_entry_count().unwrap(), 1);
    let back = read_file(&mut fs, "c.bin");
    assert_eq!(back[767], 0xee);
    assert_eq!(&back[..767], &data[..767]);
}

#[test]
fn append_mode_always_writes_at_end() {
    let mut fs = fresh();
    write_file(&mut fs, "log.txt", b"one");

    let file = fs.open("log.txt", "a").unwrap();
    fs.write(file, b"two").unwrap();
    fs.write(file, b"three").unwrap();
    fs.close(file).unwrap();

    assert_eq!(read_file(&mut fs, "log.txt"), b"onetwothree");
}

#[test]
fn gap_fill_on_seek_beyond_eof() {
    let mut fs = fresh();
    write_file(&mut fs, "gap.bin", &[0xaa; 100]);

    let file = fs.open("gap.bin", "r+").unwrap();
    fs.seek(file, SeekFrom::Start(600)).unwrap();
    assert_eq!(fs.write(file, &[0xbb; 10]).unwrap(), 10);
    fs.close(file).unwrap();

    let back = read_file(&mut fs, "gap.bin");
    assert_eq!(back.len(), 610);
    assert_eq!(&back[..100], &[0xaa; 100][..]);
    assert!(back[100..600].iter().all(|&b| b == 0));
    assert_eq!(&back[600..], &[0xbb; 10][..]);
}

#[test]
fn open_mode_errors() {
    let mut fs = fresh();
    assert_eq!(fs.open("missing", "r").unwrap_err(), Error::FileNotFound);
    assert_eq!(fs.open("x", "q").unwrap_err(), Error::InvalidOpenMode);

    write_file(&mut fs, "ro.bin", &[1, 2, 3]);
    let file = fs.open("ro.bin", "r").unwrap();
    assert_eq!(fs.write(file, &[0]).unwrap_err(), Error::General);
    fs.close(file).unwrap();
}

#[test]
fn handle_table_exhaustion() {
    let mut fs = fresh();
    let names = ["h0", "h1", "h2", "h3", "h4"];
    for name in &names {
        write_file(&mut fs, name, &[0x42; 16]);
    }
    let mut open = Vec::new();
    for name in &names[..4] {
        open.push(fs.open(name, "r").unwrap());
    }
    assert_eq!(fs.open("h4", "r").unwrap_err(), Error::NoMoreResource);
    for id in open {
        fs.close(id).unwrap();
    }
}

#[test]
fn truncate_on_w_reopen() {
    let mut fs = fresh();
    write_file(&mut fs, "t.bin", &[0x77; 1000]);

    let file = fs.open("t.bin", "w").unwrap();
    assert_eq!(fs.file_size(file).unwrap(), 0);
    fs.write(file, &[0x88; 10]).unwrap();
    fs.close(file).unwrap();

    assert_eq!(read_file(&mut fs, "t.bin"), vec![0x88; 10]);
}

#[test]
fn remove_rename_copy() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(3000).seed(5).random();
    write_file(&mut fs, "orig.bin", &data);

    fs.rename("orig.bin", "renamed.bin").unwrap();
    assert!(!fs.is_file_exist("orig.bin"));
    assert_eq!(read_file(&mut fs, "renamed.bin"), data);

    fs.copy("renamed.bin", "copy.bin").unwrap();
    assert_eq!(read_file(&mut fs, "copy.bin"), data);
    assert_eq!(read_file(&mut fs, "renamed.bin"), data);

    fs.remove("renamed.bin").unwrap();
    assert!(!fs.is_file_exist("renamed.bin"));
    assert_eq!(fs.remove("renamed.bin").unwrap_err(), Error::FileNotFound);
    assert_eq!(read_file(&mut fs, "copy.bin"), data);

    fs.check().unwrap();
}

#[test]
fn duplicate_open_is_rejected() {
    let mut fs = fresh();
    write_file(&mut fs, "solo.bin", &[1; 8]);
    let file = fs.open("solo.bin", "r").unwrap();
    assert_eq!(fs.open("solo.bin", "r").unwrap_err(), Error::NoMoreResource);
    fs.close(file).unwrap();
}
