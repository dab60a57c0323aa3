//! Disk-backed blob store with HMAC-signed URLs.
//!
//! Payloads are sharded beneath `root/{bucket}/{shard}/{shard}/{name}`.
//! Grants point at this service's own `/blobs/{bucket}/{*name}` data-plane
//! routes; those routes call [`LocalBlobStore::verify`] before touching disk.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use hmac::{Hmac, Mac};
use md5::Context;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::{BlobError, BlobResult, BlobStore, PresignedGrant, expiry_from_now};

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Unreserved URL characters pass through; everything else is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub const METHOD_PUT: &str = "PUT";
pub const METHOD_GET: &str = "GET";

/// Query parameters carried by a signed URL.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub size: Option<i64>,
    #[serde(rename = "content-type")]
    pub content_type: Option<String>,
    pub signature: String,
}

/// Outcome of a successful data-plane upload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub size: i64,
    pub etag: String,
}

#[derive(Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_url: String,
    secret: Vec<u8>,
}

impl LocalBlobStore {
    /// `public_url` is the externally reachable base of this service, used to
    /// build grant URLs. `secret` keys the URL signatures.
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(&self, key: &str) -> BlobResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(BlobError::InvalidKey("length must be 1-1024 bytes".into()));
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(BlobError::InvalidKey("must be relative and not traverse upwards".into()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::InvalidKey("contains control characters or backslashes".into()));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    /// Two-level shard directories from MD5(bucket/key).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> BlobResult<PathBuf> {
        self.ensure_key_safe(bucket)?;
        self.ensure_key_safe(key)?;
        if bucket.contains('/') {
            return Err(BlobError::InvalidKey("bucket must be a single path segment".into()));
        }
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        Ok(path)
    }

    fn canonical(
        method: &str,
        bucket: &str,
        name: &str,
        expires: i64,
        content_type: &str,
        size: Option<i64>,
    ) -> String {
        format!(
            "{method}\n{bucket}\n{name}\n{expires}\n{content_type}\n{}",
            size.map(|s| s.to_string()).unwrap_or_default()
        )
    }

    fn mac(&self, canonical: &str) -> BlobResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| BlobError::Unavailable("invalid signing key".into()))?;
        mac.update(canonical.as_bytes());
        Ok(mac)
    }

    fn grant(
        &self,
        method: &str,
        bucket: &str,
        name: &str,
        content_type: Option<&str>,
        size: Option<i64>,
        expires_in: Duration,
    ) -> BlobResult<PresignedGrant> {
        self.object_path(bucket, name)?;
        let expires = expiry_from_now(expires_in)?.timestamp();
        let expires_at = DateTime::from_timestamp(expires, 0)
            .ok_or_else(|| BlobError::Unavailable("grant expiry out of range".into()))?;

        let canonical = Self::canonical(method, bucket, name, expires, content_type.unwrap_or(""), size);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&canonical)?.finalize().into_bytes());

        let mut query = format!("expires={expires}");
        if let Some(size) = size {
            query.push_str(&format!("&size={size}"));
        }
        if let Some(content_type) = content_type {
            query.push_str(&format!("&content-type={}", utf8_percent_encode(content_type, UNRESERVED)));
        }
        query.push_str(&format!("&signature={signature}"));

        let path = name
            .split('/')
            .map(|segment| utf8_percent_encode(segment, UNRESERVED).to_string())
            .collect::<Vec<_>>()
            .join("/");

        Ok(PresignedGrant {
            url: format!(
                "{}/blobs/{}/{}?{}",
                self.public_url,
                utf8_percent_encode(bucket, UNRESERVED),
                path,
                query
            ),
            method: method.to_string(),
            expires_at,
        })
    }

    /// Check that `query` is an unexpired grant for `method` on `bucket/name`.
    ///
    /// A grant is dead from its `expires_at` instant on, the moment its
    /// expiry task becomes due.
    pub fn verify(&self, method: &str, bucket: &str, name: &str, query: &SignedQuery) -> BlobResult<()> {
        if Utc::now().timestamp_millis() >= query.expires.saturating_mul(1000) {
            return Err(BlobError::Expired);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(query.signature.as_bytes())
            .map_err(|_| BlobError::InvalidSignature)?;
        let canonical = Self::canonical(
            method,
            bucket,
            name,
            query.expires,
            query.content_type.as_deref().unwrap_or(""),
            query.size,
        );
        self.mac(&canonical)?
            .verify_slice(&signature)
            .map_err(|_| BlobError::InvalidSignature)
    }

    /// Stream a payload to disk.
    ///
    /// Bytes go to a temporary file that is fsynced and then renamed into
    /// place, so readers never observe a partial blob. When `declared_size`
    /// is set the payload must be exactly that long.
    pub async fn write_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        declared_size: Option<i64>,
        stream: S,
    ) -> BlobResult<StoredBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let file_path = self.object_path(bucket, key)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        match Self::write_tmp(&tmp_path, declared_size, stream).await {
            Ok(stored) => {
                if let Err(err) = fs::rename(&tmp_path, &file_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
                debug!("stored blob {} ({} bytes)", file_path.display(), stored.size);
                Ok(stored)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }

    async fn write_tmp<S>(tmp_path: &Path, declared_size: Option<i64>, stream: S) -> BlobResult<StoredBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut file = File::create(tmp_path).await?;
        let mut size: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as i64;
            if let Some(declared) = declared_size {
                if size > declared {
                    return Err(BlobError::SizeMismatch { declared, actual: size });
                }
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        if let Some(declared) = declared_size {
            if size != declared {
                return Err(BlobError::SizeMismatch { declared, actual: size });
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(StoredBlob {
            size,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Open a stored payload for streaming out, with its length.
    pub async fn open(&self, bucket: &str, key: &str) -> BlobResult<(File, u64)> {
        let file_path = self.object_path(bucket, key)?;
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound {
                    bucket: bucket.to_string(),
                    name: key.to_string(),
                }
            } else {
                BlobError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Write, read back, and remove a probe file under the root.
    pub async fn probe(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.root).await?;
        let tmp_path = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(BlobError::Unavailable("probe file content mismatch".into()));
        }
        Ok(())
    }

    /// Remove empty shard directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn presign_upload(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        size: i64,
        expires_in: Duration,
    ) -> BlobResult<PresignedGrant> {
        self.grant(METHOD_PUT, bucket, name, Some(content_type), Some(size), expires_in)
    }

    async fn presign_download(
        &self,
        bucket: &str,
        name: &str,
        expires_in: Duration,
    ) -> BlobResult<PresignedGrant> {
        self.grant(METHOD_GET, bucket, name, None, None, expires_in)
    }

    async fn exists(&self, bucket: &str, name: &str) -> BlobResult<bool> {
        let path = self.object_path(bucket, name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, bucket: &str, name: &str) -> BlobResult<()> {
        let file_path = self.object_path(bucket, name)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use percent_encoding::percent_decode_str;

    fn store(dir: &tempfile::TempDir) -> LocalBlobStore {
        LocalBlobStore::new(dir.path(), "http://localhost:3000/", "test-secret")
    }

    fn parse_query(url: &str) -> SignedQuery {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        let mut expires = 0;
        let mut size = None;
        let mut content_type = None;
        let mut signature = String::new();
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap();
            let value = percent_decode_str(value).decode_utf8().unwrap().to_string();
            match key {
                "expires" => expires = value.parse().unwrap(),
                "size" => size = Some(value.parse().unwrap()),
                "content-type" => content_type = Some(value),
                "signature" => signature = value,
                other => panic!("unexpected query key {other}"),
            }
        }
        SignedQuery {
            expires,
            size,
            content_type,
            signature,
        }
    }

    fn body(chunks: &[&'static [u8]]) -> stream::Iter<std::vec::IntoIter<io::Result<Bytes>>> {
        let chunks: Vec<io::Result<Bytes>> = chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        stream::iter(chunks)
    }

    #[tokio::test]
    async fn upload_grant_verifies_and_rejects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let grant = store
            .presign_upload("b1", "a/b c.svg", "image/svg+xml", 10, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(grant.method, METHOD_PUT);
        assert!(grant.url.starts_with("http://localhost:3000/blobs/b1/a/b%20c.svg?"));

        let query = parse_query(&grant.url);
        assert_eq!(query.content_type.as_deref(), Some("image/svg+xml"));
        assert_eq!(query.expires, grant.expires_at.timestamp());
        store.verify(METHOD_PUT, "b1", "a/b c.svg", &query).unwrap();

        let mut bigger = query.clone();
        bigger.size = Some(11);
        assert!(matches!(
            store.verify(METHOD_PUT, "b1", "a/b c.svg", &bigger),
            Err(BlobError::InvalidSignature)
        ));
        assert!(matches!(
            store.verify(METHOD_GET, "b1", "a/b c.svg", &query),
            Err(BlobError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn expired_grant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let grant = store
            .presign_download("b1", "a.txt", Duration::from_secs(60))
            .await
            .unwrap();
        let mut query = parse_query(&grant.url);
        query.expires = Utc::now().timestamp() - 1;
        assert!(matches!(
            store.verify(METHOD_GET, "b1", "a.txt", &query),
            Err(BlobError::Expired)
        ));
    }

    #[tokio::test]
    async fn grant_is_dead_within_its_expiry_second() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let grant = store
            .presign_upload("b1", "a.bin", "application/octet-stream", 3, Duration::ZERO)
            .await
            .unwrap();
        assert!(Utc::now() >= grant.expires_at);
        assert!(matches!(
            store.verify(METHOD_PUT, "b1", "a.bin", &parse_query(&grant.url)),
            Err(BlobError::Expired)
        ));
    }

    #[tokio::test]
    async fn write_then_exists_then_delete_prunes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(!store.exists("b1", "a/b.png").await.unwrap());

        let stored = store
            .write_stream("b1", "a/b.png", Some(10), body(&[b"01234", b"56789"]))
            .await
            .unwrap();
        assert_eq!(stored.size, 10);
        assert_eq!(stored.etag, format!("{:x}", md5::compute(b"0123456789")));
        assert!(store.exists("b1", "a/b.png").await.unwrap());

        let (_, len) = store.open("b1", "a/b.png").await.unwrap();
        assert_eq!(len, 10);

        store.delete("b1", "a/b.png").await.unwrap();
        assert!(!store.exists("b1", "a/b.png").await.unwrap());
        let mut entries = fs::read_dir(dir.path().join("b1")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        // Deleting again is not an error.
        store.delete("b1", "a/b.png").await.unwrap();
    }

    #[tokio::test]
    async fn size_mismatch_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let err = store
            .write_stream("b1", "big.bin", Some(3), body(&[b"0123"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::SizeMismatch { declared: 3, actual: 4 }));

        let err = store
            .write_stream("b1", "short.bin", Some(5), body(&[b"01"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::SizeMismatch { declared: 5, actual: 2 }));

        assert!(!store.exists("b1", "big.bin").await.unwrap());
        assert!(!store.exists("b1", "short.bin").await.unwrap());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for key in ["", "/abs", "a/../../etc", "a\\b"] {
            assert!(matches!(
                store.exists("b1", key).await,
                Err(BlobError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn probe_succeeds_on_writable_root() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).probe().await.unwrap();
    }
}
