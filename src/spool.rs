//! 上传暂存文件：请求体先完整落盘，离开作用域时无条件删除。

use axum::body::Body;
use futures_util::TryStreamExt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SPOOL_PREFIX: &str = "drive-dav-";
const SPOOL_SUFFIX: &str = ".spool";

/// Process-unique temporary file holding one request body.
pub struct SpoolFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl SpoolFile {
    /// 在暂存目录中创建唯一命名的文件。
    pub async fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let name = format!(
            "{SPOOL_PREFIX}{}-{}{SPOOL_SUFFIX}",
            std::process::id(),
            Uuid::new_v4()
        );
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self { path, file, len: 0 })
    }

    /// 把请求体完整写入暂存文件，返回写入字节数。
    pub async fn fill(&mut self, body: Body) -> io::Result<u64> {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.try_next().await.map_err(io::Error::other)? {
            self.file.write_all(&chunk).await?;
            self.len += chunk.len() as u64;
        }
        self.file.flush().await?;
        debug!(path = ?self.path, len = self.len, "request body spooled");
        Ok(self.len)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    /// 从 `offset` 读取最多 `len` 字节（文件末尾截断）。
    pub async fn read_at(&mut self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let end = offset.saturating_add(len).min(self.len);
        let mut buf = vec![0; end.saturating_sub(offset) as usize];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// 从当前位置顺序读取恰好 `len` 字节。
    pub async fn read_next(&mut self, len: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len as usize];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// 顺序读取全部内容交给 `sink`，按块回调。
    pub async fn for_each_block<F>(&mut self, mut sink: F) -> io::Result<()>
    where
        F: FnMut(&[u8]),
    {
        self.rewind().await?;
        let mut buf = vec![0; 64 * 1024];
        loop {
            let n = self.file.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            sink(&buf[..n]);
        }
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        // 删除放到阻塞线程池；运行时之外直接删除。
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_spool(&path));
            }
            Err(_) => remove_spool(&path),
        }
    }
}

fn remove_spool(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = ?path, "spool file removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = ?path, error = %err, "failed to remove spool file"),
    }
}

/// 清理崩溃遗留的过期暂存文件。
pub async fn sweep_stale(dir: &Path, ttl: Duration) -> io::Result<usize> {
    if ttl.is_zero() || fs::metadata(dir).await.is_err() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(SPOOL_PREFIX) && name.ends_with(SPOOL_SUFFIX)) {
            continue;
        }
        let metadata = entry.metadata().await?;
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age >= ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale spool file");
            } else {
                info!(path = ?path, "removed stale spool file");
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn spool_round_trip_and_drop_removes_file() {
        let temp = tempdir().expect("tempdir");
        let mut spool = SpoolFile::create(temp.path()).await.expect("create");
        let path = spool.path().to_path_buf();
        let len = spool.fill(Body::from("hello world")).await.expect("fill");
        assert_eq!(len, 11);
        assert_eq!(spool.read_at(6, 100).await.expect("read"), b"world");
        spool.rewind().await.expect("rewind");
        assert_eq!(spool.read_next(5).await.expect("next"), b"hello");

        drop(spool);
        assert!(wait_until_removed(&path).await);
    }

    #[tokio::test]
    async fn dropped_spool_is_removed_off_the_async_worker() {
        let temp = tempdir().expect("tempdir");
        let spools = futures_util::future::join_all(
            (0..8).map(|_| SpoolFile::create(temp.path())),
        )
        .await;
        let paths = spools
            .into_iter()
            .map(|spool| spool.expect("create").path().to_path_buf())
            .collect::<Vec<_>>();
        for path in &paths {
            assert!(wait_until_removed(path).await, "{path:?} left behind");
        }
    }

    async fn wait_until_removed(path: &Path) -> bool {
        for _ in 0..100 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn sweep_removes_only_spool_files() {
        let temp = tempdir().expect("tempdir");
        let stale = temp.path().join(format!("{SPOOL_PREFIX}1-x{SPOOL_SUFFIX}"));
        let other = temp.path().join("keep.txt");
        std::fs::write(&stale, b"x").expect("write");
        std::fs::write(&other, b"x").expect("write");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let removed = sweep_stale(temp.path(), Duration::from_millis(10))
            .await
            .expect("sweep");
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(other.exists());

        assert_eq!(sweep_stale(temp.path(), Duration::ZERO).await.expect("noop"), 0);
    }
}
