// Wear accounting and leveling.

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

fn write_file(fs: &mut Pifs<SimFlash>, name: &str, data: &[u8]) {
    let file = fs.open(name, "w").unwrap();
    assert_eq!(fs.write(file, data).unwrap(), data.len());
    fs.close(file).unwrap();
}

/// Force one merge through delta exhaustion.
fn force_merge(fs: &mut Pifs<SimFlash>) {
    let name = "churn-delta.bin";
    write_file(fs, name, &[0x3c; 64]);
    let file = fs.open(name, "r+").unwrap();
    let before = fs.header_counter();
    let mut i = 0u32;
    while fs.header_counter() == before {
        fs.seek(file, SeekFrom::Start(0)).unwrap();
        fs.write(file, &[i as u8]).unwrap();
        i += 1;
        assert!(i < 1000, "merge never happened");
    }
    fs.close(file).unwrap();
    fs.remove(name).unwrap();
}

#[test]
fn merge_erases_and_counts_old_management_area() {
    let mut fs = fresh();
    // Format erased every block once; that does not count as wear.
    let baseline: Vec<u32> = fs.flash().erase_counts().to_vec();
    assert!(baseline.iter().all(|&c| c == 1));
    assert_eq!(fs.wear_level(0).unwrap(), 0);

    force_merge(&mut fs);

    // The old management area (block 0) was erased exactly once and the
    // erase is visible in the wear list.
    assert_eq!(fs.flash().erase_count(0), baseline[0] + 1);
    assert_eq!(fs.wear_level(0).unwrap(), 1);
    // The header now lives in the former secondary area.
    assert!(fs.flash().page(1, 0).iter().any(|&b| b != 0xff));
    assert!(fs.flash().page(0, 0).iter().all(|&b| b == 0xff));
}

#[test]
fn wear_list_matches_device_erase_counts() {
    let mut fs = fresh();
    let baseline: Vec<u32> = fs.flash().erase_counts().to_vec();

    let data = PatternBuilder::default().size(8 * 1024).seed(1).random();
    for cycle in 0..120 {
        let name = format!("cycle{}.bin", cycle % 3);
        write_file(&mut fs, &name, &data);
        if cycle % 3 == 2 {
            fs.remove(&name).unwrap();
        }
    }

    // Every erase the filesystem performed after format is latched in the
    // wear level list.
    for ba in 0..16u16 {
        let counted = fs.wear_level(ba).unwrap();
        let device = fs.flash().erase_count(ba as usize) - baseline[ba as usize];
        assert_eq!(counted, device, "block {}", ba);
    }
}

#[test]
fn churn_keeps_data_block_wear_spread_bounded() {
    let mut fs = fresh();
    let data = PatternBuilder::default().size(4 * 1024).seed(2).random();

    // Ten thousand write cycles, each creating and deleting a file, with
    // the periodic static wear leveling hook exercised along the way.
    for cycle in 0..10_000 {
        let name = format!("spread{}.bin", cycle % 4);
        write_file(&mut fs, &name, &data);
        fs.remove(&name).unwrap();
        if cycle % 250 == 0 {
            fs.static_wear_leveling(2).unwrap();
        }
    }

    let mut levels = Vec::new();
    for ba in 2..16u16 {
        levels.push(fs.wear_level(ba).unwrap());
    }
    let max = *levels.iter().max().unwrap();
    let min = *levels.iter().min().unwrap();
    assert!(
        max - min <= 20 + 10,
        "wear spread too wide: {:?}",
        levels
    );
    fs.check().unwrap();
}

#[test]
fn static_leveling_moves_pinned_cold_file() {
    let mut fs = fresh();

    // Pin a full block's worth of data that never changes.
    let pinned = PatternBuilder::default().size(64 * 1024).seed(3).random();
    write_file(&mut fs, "pinned.bin", &pinned);
    let pinned_block_wear_before = fs.wear_level(2).unwrap();

    // Churn everything else until the wear gap crosses the static limit.
    // Whole-block files make every removal leave a dead block for the next
    // merge, so the hot blocks' counters climb quickly.
    let data = PatternBuilder::default().size(64 * 1024).seed(4).random();
    for cycle in 0..400 {
        let name = format!("hot{}.bin", cycle % 2);
        write_file(&mut fs, &name, &data);
        fs.remove(&name).unwrap();
        if cycle % 10 == 0 {
            fs.static_wear_leveling(4).unwrap();
        }
    }
    for _ in 0..8 {
        fs.static_wear_leveling(4).unwrap();
    }
    force_merge(&mut fs);

    // The pinned file is intact...
    let file = fs.open("pinned.bin", "r").unwrap();
    let mut back = vec![0u8; pinned.len()];
    assert_eq!(fs.read(file, &mut back).unwrap(), pinned.len());
    assert_eq!(back, pinned);
    fs.close(file).unwrap();

    // ...and its original block has been erased at least once more, which
    // only happens after the file was relocated off it.
    let wear_after = fs.wear_level(2).unwrap();
    assert!(
        wear_after > pinned_block_wear_before,
        "cold block was never recycled (wear {})",
        wear_after
    );
}
