//! A local cache for images served from the Instagram CDN.
//!
//! CDN URLs expire and refuse cross-origin embedding, so images shown to clients are downloaded
//! once and served from the cache directory instead.

use anyhow::Error;
use async_std::fs;
use clap::Args;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// The image returned when a download fails.
pub const DEFAULT_IMAGE: &str = "default.png";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Image cache options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Directory where downloaded images are cached.
    #[clap(long, env = "CLONNER_CACHE_DIR", default_value = "cache")]
    pub cache_dir: PathBuf,

    /// Replace image URLs in responses with links to locally cached copies.
    #[clap(long, env = "CLONNER_CACHE_IMAGES")]
    pub cache_images: bool,
}

/// Downloads images and keeps them in a directory.
#[derive(Clone)]
pub struct CacheManager {
    dir: PathBuf,
    client: surf::Client,
}

impl CacheManager {
    /// Open the cache in `dir`, creating the directory if necessary.
    pub fn new(dir: PathBuf) -> Result<Self, Error> {
        std::fs::create_dir_all(&dir)?;
        let client: surf::Client = surf::Config::default()
            .set_timeout(Some(DOWNLOAD_TIMEOUT))
            .try_into()?;
        Ok(Self { dir, client })
    }

    /// The directory holding cached images.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the file name from a CDN URL.
    ///
    /// CDN URLs have the form `https://<host>/v/<bucket>/<name>?<params>`, so the name is the
    /// sixth `/`-separated segment, without the query string.
    pub fn extract_filename(url: &str) -> Option<String> {
        let name = url
            .split('/')
            .nth(5)
            .and_then(|segment| segment.split('?').next())
            .unwrap_or_default();
        if name.is_empty() || name == "." || name == ".." {
            tracing::warn!("failed to extract file name from URL {url}");
            None
        } else {
            Some(name.to_string())
        }
    }

    /// Download the image at `url` into the cache.
    ///
    /// An image which is already cached is not downloaded again unless `fresh` is set.
    ///
    /// # Returns
    ///
    /// The name of the cached file, or [`DEFAULT_IMAGE`] if the download failed.
    pub async fn save(&self, url: &str, fresh: bool) -> String {
        let name =
            Self::extract_filename(url).unwrap_or_else(|| format!("{}.jpg", Uuid::new_v4()));
        let path = self.dir.join(&name);

        if !fresh && fs::metadata(&path).await.is_ok() {
            tracing::debug!("loaded cached {name}");
            return name;
        }

        match self.download(url, &path).await {
            Ok(()) => {
                tracing::debug!("image {name} has just been cached");
                name
            }
            Err(err) => {
                tracing::warn!("failed to cache image {name}: {err}");
                DEFAULT_IMAGE.into()
            }
        }
    }

    async fn download(&self, url: &str, path: &Path) -> Result<(), Error> {
        let mut res = self.client.get(url).send().await.map_err(Error::msg)?;
        if res.status() != surf::StatusCode::Ok {
            let body = res.body_string().await.unwrap_or_default();
            return Err(Error::msg(format!("HTTP {}: {body}", res.status())));
        }
        let bytes = res.body_bytes().await.map_err(Error::msg)?;
        fs::write(path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_std::task::{sleep, spawn};
    use portpicker::pick_unused_port;
    use tempfile::tempdir;
    use tide::{Response, StatusCode};

    #[test]
    fn test_extract_filename() {
        assert_eq!(
            CacheManager::extract_filename(
                "https://scontent-arn2-1.cdninstagram.com/v/t51.2885-19/abc_n.jpg?stp=dst&x=1"
            )
            .as_deref(),
            Some("abc_n.jpg")
        );
        assert_eq!(
            CacheManager::extract_filename("https://cdn.example.com/v/t51/plain.png").as_deref(),
            Some("plain.png")
        );
        assert_eq!(CacheManager::extract_filename("https://cdn.example.com/short"), None);
        assert_eq!(
            CacheManager::extract_filename("https://cdn.example.com/v/t51/?x=1"),
            None
        );
        assert_eq!(
            CacheManager::extract_filename("https://cdn.example.com/v/t51/../x"),
            None
        );
    }

    /// Serve a single image at `/v/t51/img_n.jpg`.
    async fn mock_cdn() -> u16 {
        let mut app = tide::new();
        app.at("/v/t51/img_n.jpg").get(|_| async {
            let mut res = Response::new(StatusCode::Ok);
            res.set_body(vec![0xffu8, 0xd8, 0xff]);
            Ok(res)
        });
        let port = pick_unused_port().unwrap();
        spawn(app.listen(format!("127.0.0.1:{port}")));
        for _ in 0..50 {
            if surf::get(format!("http://127.0.0.1:{port}/")).await.is_ok() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        port
    }

    #[async_std::test]
    async fn test_save() {
        let port = mock_cdn().await;
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(dir.path().join("cache")).unwrap();

        let url = format!("http://127.0.0.1:{port}/v/t51/img_n.jpg?stp=1");
        assert_eq!(cache.save(&url, false).await, "img_n.jpg");
        let path = cache.dir().join("img_n.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, 0xd8, 0xff]);

        // Cached files are reused unless a fresh copy is requested.
        std::fs::write(&path, b"stale").unwrap();
        assert_eq!(cache.save(&url, false).await, "img_n.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), b"stale");
        assert_eq!(cache.save(&url, true).await, "img_n.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, 0xd8, 0xff]);
    }

    #[async_std::test]
    async fn test_save_failures() {
        let port = mock_cdn().await;
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(dir.path().into()).unwrap();

        let missing = format!("http://127.0.0.1:{port}/v/t51/missing_n.jpg");
        assert_eq!(cache.save(&missing, false).await, DEFAULT_IMAGE);
        assert!(!dir.path().join("missing_n.jpg").exists());

        // Without a usable file name the download is attempted under a random name.
        let unnamed = format!("http://127.0.0.1:{port}/");
        assert_eq!(cache.save(&unnamed, false).await, DEFAULT_IMAGE);
    }
}
