use std::io::SeekFrom;

use extalloc::{
    DirectMapper, FileBlockEmulatorBuilder, FileFlags, FileHandle, Filesystem, FsFlags, Geometry,
};

pub fn main() -> extalloc::Result<()> {
    let tmp = tempfile::tempfile().expect("could not create a backing file");
    let geometry = Geometry::default();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(geometry.blocks_count)
        .with_block_size(geometry.block_size)
        .build()
        .expect("could not initialize disk emulator");
    let fs = Filesystem::new(dev, geometry, FsFlags::RW)?;

    let mut blocks = fs.allocate_block_bitmap("block bitmap")?;
    fs.mark_metadata_blocks(&mut blocks)?;

    {
        let mut file = FileHandle::open(
            &fs,
            12,
            FileFlags::WRITE | FileFlags::CREATE,
            DirectMapper::new(&mut blocks),
        )?;
        file.write(b"hello, block device")?;
        file.seek(SeekFrom::Start(0))?;
        let back = file.read(5)?;
        println!("read back {:?}", String::from_utf8_lossy(&back));
        file.close()?;
    }

    fs.write_bitmap(&blocks, geometry.block_bitmap)?;
    fs.sync()?;
    println!(
        "{} of {} blocks in use",
        blocks.count_set(blocks.start(), blocks.end())?,
        geometry.blocks_count - geometry.first_data_block
    );
    blocks.print_stats();
    Ok(())
}
