// Management-area merge: space reclamation and delta map collapse.

use pifs::{Error, Pifs};
use pifs::SeekFrom;
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

const FILE_PAGES: usize = 64;
const FILE_BYTES: usize = FILE_PAGES * 256;

fn file_name(i: usize) -> String {
    format!("fill{:03}.bin", i)
}

#[test]
fn fill_delete_half_write_again() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(FILE_BYTES).seed(77).random();

    // Fill the device until a write no longer fits.
    let mut full = Vec::new();
    for i in 0..100 {
        let name = file_name(i);
        let file = fs.open(&name, "w").unwrap();
        let written = fs.write(file, &data);
        fs.close(file).unwrap();
        match written {
            Ok(n) if n == FILE_BYTES => full.push(name),
            Ok(_) => {
                // Short write: the device is full.
                fs.remove(&name).unwrap();
                break;
            }
            Err(Error::NoMoreSpace) => {
                fs.remove(&name).unwrap();
                break;
            }
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }
    assert!(full.len() >= 50, "filled only {} files", full.len());

    // Nothing further fits.
    let name = String::from("nofit.bin");
    let file = fs.open(&name, "w").unwrap();
    let r = fs.write(file, &data);
    assert!(matches!(r, Ok(n) if n < FILE_BYTES) || matches!(r, Err(Error::NoMoreSpace)));
    fs.close(file).unwrap();
    fs.remove(&name).unwrap();

    // Delete the first half and the merge reclaims their blocks.
    let half = full.len() / 2;
    for name in &full[..half] {
        fs.remove(name).unwrap();
    }
    let counter_before = fs.header_counter();

    let big = PatternBuilder::default().size(100 * 1024).seed(78).random();
    let file = fs.open("big.bin", "w").unwrap();
    assert_eq!(fs.write(file, &big).unwrap(), big.len());
    fs.close(file).unwrap();
    assert!(fs.header_counter() > counter_before, "no merge happened");

    // Survivors and the new file are intact.
    let file = fs.open("big.bin", "r").unwrap();
    let mut back = vec![0u8; big.len()];
    assert_eq!(fs.read(file, &mut back).unwrap(), big.len());
    assert_eq!(back, big);
    fs.close(file).unwrap();

    let file = fs.open(&full[half], "r").unwrap();
    let mut back = vec![0u8; FILE_BYTES];
    assert_eq!(fs.read(file, &mut back).unwrap(), FILE_BYTES);
    assert_eq!(back, data);
    fs.close(file).unwrap();

    fs.check().unwrap();
}

#[test]
fn delta_exhaustion_forces_exactly_one_merge() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(200).seed(5).random();
    let file = fs.open("hot.bin", "w").unwrap();
    fs.write(file, &data).unwrap();
    fs.close(file).unwrap();

    let counter_before = fs.header_counter();
    // One more rewrite than the delta map can hold.
    let rewrites = 2 * 21 + 1;

    let file = fs.open("hot.bin", "r+").unwrap();
    for i in 0..rewrites {
        fs.seek(file, SeekFrom::Start(0)).unwrap();
        assert_eq!(fs.write(file, &[i as u8]).unwrap(), 1, "rewrite {}", i);
    }
    fs.close(file).unwrap();

    assert_eq!(
        fs.header_counter(),
        counter_before + 1,
        "expected exactly one merge"
    );

    let file = fs.open("hot.bin", "r").unwrap();
    let mut byte = [0u8; 1];
    fs.read(file, &mut byte).unwrap();
    assert_eq!(byte[0], (rewrites - 1) as u8);
    fs.close(file).unwrap();

    fs.check().unwrap();
}

#[test]
fn exact_capacity_then_merge_on_next_allocation() {
    let mut fs = fresh();
    let free = fs.get_free_space().unwrap().data_bytes;

    // Consume every free data page.
    let chunk = PatternBuilder::default().size(64 * 1024).seed(6).random();
    let file = fs.open("all.bin", "w").unwrap();
    let mut remaining = free;
    while remaining > 0 {
        let n = fs.write(file, &chunk[..chunk.len().min(remaining)]).unwrap();
        assert!(n > 0);
        remaining -= n;
    }
    fs.close(file).unwrap();
    assert_eq!(fs.get_free_space().unwrap().data_pages, 0);

    // The next data allocation cannot be satisfied: a merge is attempted
    // and the write still fails.
    let counter_before = fs.header_counter();
    let file = fs.open("extra.bin", "w").unwrap();
    assert_eq!(fs.write(file, &[0u8; 256]).unwrap_err(), Error::NoMoreSpace);
    fs.close(file).unwrap();
    assert!(fs.header_counter() > counter_before);

    // Deleting the big file makes room again.
    fs.remove("extra.bin").unwrap();
    fs.remove("all.bin").unwrap();
    let file = fs.open("again.bin", "w").unwrap();
    assert_eq!(fs.write(file, &[7u8; 1024]).unwrap(), 1024);
    fs.close(file).unwrap();
}

#[test]
fn merge_survives_remount() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(300).seed(9).random();
    let file = fs.open("m.bin", "w").unwrap();
    fs.write(file, &data).unwrap();
    fs.close(file).unwrap();

    // Force a merge through delta exhaustion.
    let file = fs.open("m.bin", "r+").unwrap();
    for i in 0..(2 * 21 + 1) {
        fs.seek(file, SeekFrom::Start(4)).unwrap();
        fs.write(file, &[i as u8]).unwrap();
    }
    fs.close(file).unwrap();
    let counter = fs.header_counter();
    assert!(counter > 0);

    fs.delete().unwrap();
    fs.init().unwrap();
    assert_eq!(fs.header_counter(), counter);

    let file = fs.open("m.bin", "r").unwrap();
    let mut back = vec![0u8; 300];
    assert_eq!(fs.read(file, &mut back).unwrap(), 300);
    assert_eq!(back[4], (2 * 21) as u8);
    assert_eq!(&back[..4], &data[..4]);
    assert_eq!(&back[5..], &data[5..]);
    fs.close(file).unwrap();

    fs.check().unwrap();
}
