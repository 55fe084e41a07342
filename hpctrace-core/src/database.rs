//! DatabaseOpener (§2, §6.2): validates a directory as a database and, if
//! necessary, merges per-shard `*.hpctrace` files into a single
//! `experiment.mt` file before handing a [`SpaceTimeController`] back.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::controller::SpaceTimeController;
use crate::error::{Error, Result};

pub const END_MARKER: u64 = 0xFFFFFFFFDEADF00D;

/// A database directory whose `.mt` file is smaller than this cannot hold
/// even an empty rank table plus the end marker; reject it up front the way
/// the original opener's size sanity check does.
pub const MIN_TRACE_SIZE: u64 = 8 + 8;

pub struct DatabaseOpener;

impl DatabaseOpener {
    /// Validate `dir` as a database and open it, merging shards first if no
    /// `.mt` file exists yet (§6.2).
    pub fn open(dir: impl AsRef<Path>, page_size: u64, memory_budget: u64) -> Result<SpaceTimeController> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::InvalidDatabase(format!("{} is not a directory", dir.display())));
        }

        let xml_path = dir.join("experiment.xml");
        if !xml_path.is_file() {
            return Err(Error::InvalidDatabase("experiment.xml not found".into()));
        }

        let mt_path = dir.join("experiment.mt");
        if mt_path.is_file() {
            if !Self::is_merged_file_correct(&mt_path)? {
                return Err(Error::InvalidDatabase("experiment.mt end marker mismatch".into()));
            }
        } else {
            let shards = Self::discover_shards(dir)?;
            if shards.is_empty() {
                return Err(Error::InvalidDatabase("no *.hpctrace shards found".into()));
            }
            Self::merge(&shards, &mt_path)?;
        }

        let size = fs::metadata(&mt_path)?.len();
        if size < MIN_TRACE_SIZE {
            return Err(Error::InvalidDatabase("trace file too small".into()));
        }

        SpaceTimeController::open(xml_path, mt_path, page_size, memory_budget)
    }

    fn discover_shards(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut shards: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("hpctrace"))
            .collect();
        // "concatenate each shard's record bytes in lexicographic filename
        // order" (§6.2).
        shards.sort();
        Ok(shards)
    }

    /// `…-P-T-…hpctrace` where `P`/`T` sit at positions 5 and 4 (0-based,
    /// counted from the right after stripping the `.hpctrace` suffix and
    /// splitting on `-`) (§6.2, grounded on the original shard merger's
    /// fixed token positions).
    fn parse_pid_tid(file_name: &str) -> Result<(i32, i32)> {
        let stem = file_name
            .strip_suffix(".hpctrace")
            .ok_or_else(|| Error::InvalidDatabase(format!("{file_name} is not a .hpctrace shard")))?;
        let tokens: Vec<&str> = stem.split('-').collect();
        if tokens.len() < 6 {
            return Err(Error::InvalidDatabase(format!(
                "{file_name} does not have enough '-'-separated fields for process/thread ids"
            )));
        }
        let n = tokens.len();
        let parse = |tok: &str| {
            tok.parse::<i32>()
                .map_err(|_| Error::InvalidDatabase(format!("{file_name}: bad process/thread id field {tok:?}")))
        };
        let pid = parse(tokens[n - 5])?;
        let tid = parse(tokens[n - 4])?;
        Ok((pid, tid))
    }

    /// Merge `shards` into a fresh `.mt` file at `mt_path` (§6.2): a
    /// 32-bit type flag, 32-bit rank count, `rank_count` ×
    /// `(P:i32, T:i32, start_offset:i64)`, the concatenated shard bytes,
    /// then the 64-bit end marker.
    fn merge(shards: &[PathBuf], mt_path: &Path) -> Result<()> {
        let mut multi_process = false;
        let mut multi_threading = false;
        let mut entries = Vec::with_capacity(shards.len());
        for shard in shards {
            let file_name = shard
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::InvalidDatabase(format!("non-UTF8 shard name: {}", shard.display())))?;
            let (pid, tid) = Self::parse_pid_tid(file_name)?;
            multi_process |= pid != 0;
            multi_threading |= tid != 0;
            let len = fs::metadata(shard)?.len();
            entries.push((pid, tid, shard.clone(), len));
        }

        let header_len = 8 + 16 * entries.len() as u64;
        let mut starts = Vec::with_capacity(entries.len());
        let mut offset = header_len;
        for (_, _, _, len) in &entries {
            starts.push(offset);
            offset += len;
        }

        let mut type_flag = 0u32;
        if multi_process {
            type_flag |= 1 << 0;
        }
        if multi_threading {
            type_flag |= 1 << 1;
        }

        let mut out = File::create(mt_path)?;
        out.write_all(&type_flag.to_be_bytes())?;
        out.write_all(&(entries.len() as u32).to_be_bytes())?;
        for (i, (pid, tid, _, _)) in entries.iter().enumerate() {
            out.write_all(&(*pid as u32).to_be_bytes())?;
            out.write_all(&(*tid as u32).to_be_bytes())?;
            out.write_all(&starts[i].to_be_bytes())?;
        }
        for (_, _, path, _) in &entries {
            let mut shard_file = File::open(path)?;
            std::io::copy(&mut shard_file, &mut out)?;
        }
        out.write_all(&END_MARKER.to_be_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn is_merged_file_correct(mt_path: &Path) -> Result<bool> {
        let mut f = File::open(mt_path)?;
        let len = f.metadata()?.len();
        if len < 8 {
            return Ok(false);
        }
        f.seek(SeekFrom::End(-8))?;
        let mut buf = [0u8; 8];
        f.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf) == END_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_shard(dir: &Path, name: &str, records: &[(u64, u32)]) {
        let mut f = File::create(dir.join(name)).unwrap();
        for (t, c) in records {
            f.write_all(&t.to_be_bytes()).unwrap();
            f.write_all(&c.to_be_bytes()).unwrap();
        }
    }

    #[test]
    fn merges_shards_in_lexicographic_order_and_validates_marker() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("experiment.xml"), b"<experiment/>").unwrap();
        write_shard(tmp.path(), "run-0000-00-1-0-0-host.hpctrace", &[(100, 1), (200, 2)]);
        write_shard(tmp.path(), "run-0000-00-0-0-0-host.hpctrace", &[(10, 9)]);

        let controller = DatabaseOpener::open(tmp.path(), 4096, 8 * 1024 * 1024).unwrap();
        assert_eq!(controller.rank_count(), 2);

        // Reopening must reuse the validated .mt rather than re-merging.
        let reopened = DatabaseOpener::open(tmp.path(), 4096, 8 * 1024 * 1024).unwrap();
        assert_eq!(reopened.rank_count(), controller.rank_count());
    }

    #[test]
    fn rejects_directory_without_xml() {
        let tmp = TempDir::new().unwrap();
        write_shard(tmp.path(), "run-0-0-0-0-0-host.hpctrace", &[(1, 1)]);
        let err = DatabaseOpener::open(tmp.path(), 4096, 8 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidDatabase(_)));
    }

    #[test]
    fn rejects_corrupt_merged_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("experiment.xml"), b"<experiment/>").unwrap();
        fs::write(tmp.path().join("experiment.mt"), b"not a valid merged file").unwrap();
        let err = DatabaseOpener::open(tmp.path(), 4096, 8 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidDatabase(_)));
    }
}
