//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        match self.read_via_proc_mem(addr, buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, buf);
                    }
                }
                Err(e)
            }
        }
    }

    fn read_via_proc_mem(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))?;
        file.read_exact(buf)?;

        Ok(buf.len())
    }

    /// メモリにデータを書き込む
    ///
    /// /proc/pid/mem への書き込みはページ保護を無視するため、テキスト領域にも書き込めます。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<usize> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))?;

        Ok(data.len())
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    fn read_via_ptrace(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<usize>();

        for offset in (0..buf.len()).step_by(word_size) {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr as usize + offset, e)
            })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (buf.len() - offset).min(word_size);
            buf[offset..offset + copy_size].copy_from_slice(&bytes[..copy_size]);
        }

        Ok(buf.len())
    }

    /// 実行可能ファイルのロードバイアスを取得する
    ///
    /// PIEの場合、DWARF上のアドレスはファイル内オフセットなので、
    /// 最初の実行可能セグメントの開始アドレスからファイルオフセットを引いた値を加算する必要があります。
    pub fn get_base_address(&self) -> Result<u64> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        // 例: "7f1234567000-7f1234568000 r-xp 00001000 08:01 123456 /usr/bin/prog"
        for line in reader.lines() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                continue;
            }

            let Some((start, _end)) = parts[0].split_once('-') else {
                continue;
            };

            if parts[1].chars().nth(2) == Some('x') {
                let start = u64::from_str_radix(start, 16)
                    .map_err(|e| anyhow::anyhow!("Failed to parse base address: {}", e))?;
                let offset = u64::from_str_radix(parts[2], 16)
                    .map_err(|e| anyhow::anyhow!("Failed to parse segment offset: {}", e))?;
                return Ok(start - offset);
            }
        }

        Err(anyhow::anyhow!("Could not find executable segment in memory mappings"))
    }
}
