use crate::error::{FsError, Result};
use crate::layout::{Block, BLOCK_SIZE};
use alloc::vec::Vec;
use spin::mutex::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

// 块设备接口，定义从块设备读写数据的方法
// 返回实际传输的字节数，只有等于BLOCK_SIZE才算成功
pub trait BlockDevice: Send + Sync {
    fn read(&self, block_id: u32, data: &mut [u8]) -> io::Result<usize>;
    fn write(&self, block_id: u32, data: &[u8]) -> io::Result<usize>;
    // 介质大小，单位字节
    fn media_size(&self) -> io::Result<u64>;
}

// 读取一个完整的块，部分读取视为失败
pub fn read_block(device: &dyn BlockDevice, block_id: u32, buf: &mut Block) -> Result<()> {
    let transferred = device
        .read(block_id, &mut buf[..])
        .map_err(|source| FsError::Io {
            block: block_id,
            source,
        })?;
    if transferred != BLOCK_SIZE {
        return Err(FsError::ShortTransfer {
            block: block_id,
            transferred,
        });
    }
    Ok(())
}

pub fn write_block(device: &dyn BlockDevice, block_id: u32, buf: &Block) -> Result<()> {
    let transferred = device
        .write(block_id, &buf[..])
        .map_err(|source| FsError::Io {
            block: block_id,
            source,
        })?;
    if transferred != BLOCK_SIZE {
        return Err(FsError::ShortTransfer {
            block: block_id,
            transferred,
        });
    }
    Ok(())
}

// 文件或者原始设备节点作为块设备
pub struct FileBlockDevice(Mutex<File>);

impl FileBlockDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        return Ok(Self(Mutex::new(file)));
    }

    // 创建一个指定大小的镜像文件
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size)?;
        return Ok(Self(Mutex::new(file)));
    }

    pub fn from_file(file: File) -> Self {
        Self(Mutex::new(file))
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&self, block_id: u32, data: &mut [u8]) -> io::Result<usize> {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start(block_id as u64 * BLOCK_SIZE as u64))?;
        let mut done = 0;
        while done < data.len() {
            match file.read(&mut data[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        // 恢复文件位置
        file.seek(SeekFrom::Start(0))?;
        Ok(done)
    }

    fn write(&self, block_id: u32, data: &[u8]) -> io::Result<usize> {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start(block_id as u64 * BLOCK_SIZE as u64))?;
        let mut done = 0;
        while done < data.len() {
            match file.write(&data[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(done)
    }

    fn media_size(&self) -> io::Result<u64> {
        // 块设备节点的metadata长度为0，用seek到末尾得到大小
        let mut file = self.0.lock();
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(size)
    }
}

// 内存块设备，越界的读写返回0字节
pub struct MemoryBlockDevice {
    data: Mutex<Vec<u8>>,
}

impl MemoryBlockDevice {
    pub fn new(block_count: u32) -> Self {
        Self {
            data: Mutex::new(alloc::vec![0u8; block_count as usize * BLOCK_SIZE]),
        }
    }

    pub fn block_count(&self) -> u32 {
        (self.data.lock().len() / BLOCK_SIZE) as u32
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read(&self, block_id: u32, data: &mut [u8]) -> io::Result<usize> {
        let mem = self.data.lock();
        let start = block_id as usize * BLOCK_SIZE;
        if start >= mem.len() {
            return Ok(0);
        }
        let len = data.len().min(mem.len() - start);
        data[..len].copy_from_slice(&mem[start..start + len]);
        Ok(len)
    }

    fn write(&self, block_id: u32, data: &[u8]) -> io::Result<usize> {
        let mut mem = self.data.lock();
        let start = block_id as usize * BLOCK_SIZE;
        if start >= mem.len() {
            return Ok(0);
        }
        let len = data.len().min(mem.len() - start);
        mem[start..start + len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn media_size(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
