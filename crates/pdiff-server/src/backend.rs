//! The pdiff core as seen by the HTTP layer.
//!
//! [`Backend`] ties the metadata [`Database`] to the [`BlobStore`]. Every
//! store call runs on the blocking pool with its own SQLite connection, so
//! requests for different sites never queue behind one another; writes to
//! the same record are serialized by the store's immediate transactions.
//!
//! Image and diff writes are two-phase: the PNG blob is written first and
//! the metadata row second. They are not atomic together; a failed metadata
//! write leaves an orphaned blob, which is logged and counted and can later
//! be found with [`Backend::find_orphaned_blobs`].

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pdiff_shared::{issue_credentials, verify_upload, ImageUpload};
use pdiff_store::{Database, DiffImage, DiffSummary, Image, Site};

use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::error::ServiceError;

type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Clone)]
pub struct Backend {
    db_path: Arc<PathBuf>,
    blobs: Arc<BlobStore>,
    max_upload_size: usize,
    orphans: Arc<AtomicU64>,
}

impl Backend {
    /// `db_path` must name a database already migrated by
    /// [`Database::open_at`].
    pub fn new(db_path: PathBuf, blobs: BlobStore, max_upload_size: usize) -> Self {
        Self {
            db_path: Arc::new(db_path),
            blobs: Arc::new(blobs),
            max_upload_size,
            orphans: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Migrate the database and open the blob store named by `config`.
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        let db_path = match &config.database_path {
            Some(path) => path.clone(),
            None => Database::default_path()?,
        };

        let migrate_path = db_path.clone();
        run_blocking(move || Database::open_at(&migrate_path).map(drop)).await?;

        let blobs = BlobStore::new(config.blob_storage_path.clone(), config.max_blob_size).await?;
        Ok(Self::new(db_path, blobs, config.max_image_size))
    }

    /// Diagnostic sink for errors the caller is about to turn into a response.
    pub fn report_error(&self, context: &str, err: &dyn std::error::Error) {
        error!(context, error = %err, "pdiff request failed");
    }

    /// Run `op` against a fresh connection on the blocking pool.
    async fn with_db<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> pdiff_store::Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.db_path);
        run_blocking(move || {
            let mut db = Database::connect(&path)?;
            op(&mut db)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Sites
    // ------------------------------------------------------------------

    pub async fn create_site(&self, name: &str) -> Result<Site> {
        let name = name.to_string();
        self.with_db(move |db| db.create_site(&name)).await
    }

    pub async fn assign_key(&self, name: &str, key: &[u8], secret: &[u8]) -> Result<()> {
        let (name, key, secret) = (name.to_string(), key.to_vec(), secret.to_vec());
        self.with_db(move |db| db.assign_key(&name, &key, &secret))
            .await
    }

    pub async fn get_site(&self, name: &str) -> Result<Site> {
        let name = name.to_string();
        self.with_db(move |db| db.get_site(&name)).await
    }

    /// Create a site, issue its credentials and attach them.
    ///
    /// The returned site carries the secret; this is the only time it
    /// leaves the service.
    pub async fn register_site(&self, name: &str) -> Result<Site> {
        let mut site = self.create_site(name).await?;

        let creds = issue_credentials()?;
        self.assign_key(name, &creds.key, &creds.secret).await?;

        site.key = creds.key.to_vec();
        site.secret = creds.secret.to_vec();

        info!(site = name, "site registered");
        Ok(site)
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    /// Check an upload's claimed key and signature against the stored site.
    pub async fn authenticate_upload(&self, upload: &ImageUpload) -> Result<Site> {
        let site = self.get_site(&upload.site).await?;
        if !site.has_credentials() {
            warn!(site = %site.name, "upload for a site without an assigned key");
            return Err(ServiceError::AuthenticationFailed);
        }
        if let Err(e) = verify_upload(&site.name, &site.key, &site.secret, upload) {
            warn!(site = %site.name, group = %upload.group, id = upload.id, "upload rejected");
            return Err(e.into());
        }
        Ok(site)
    }

    /// Authenticate, decode and store an uploaded image.
    ///
    /// The size cap applies to the bytes as uploaded; the re-encoded PNG is
    /// only bounded by the blob store's own limit.
    pub async fn ingest_upload(&self, upload: &ImageUpload) -> Result<()> {
        if upload.image.len() > self.max_upload_size {
            return Err(ServiceError::BlobTooLarge {
                size: upload.image.len(),
                max: self.max_upload_size,
            });
        }

        let site = self.authenticate_upload(upload).await?;
        let image = decode_image(&upload.image)?;
        self.store_image(&site.name, &upload.group, upload.id, &image)
            .await
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    pub async fn store_image(
        &self,
        site: &str,
        group: &str,
        id: i64,
        image: &DynamicImage,
    ) -> Result<()> {
        // Cheap pre-checks so the common failures don't leave a blob behind.
        let (s, g) = (site.to_string(), group.to_string());
        let exists = self
            .with_db(move |db| {
                db.get_site(&s)?;
                db.image_exists(&s, &g, id)
            })
            .await?;
        if exists {
            return Err(ServiceError::AlreadyExists);
        }

        let png = encode_png(image)?;
        let blob_id = self.blobs.store_blob(&png).await?;

        let (width, height) = (image.width(), image.height());
        self.record_image(Image {
            site: site.to_string(),
            group: group.to_string(),
            id,
            width,
            height,
            blob_id,
            created_at: Utc::now(),
        })
        .await?;

        info!(site, group, id, width, height, "image stored");
        Ok(())
    }

    /// Second phase of [`Backend::store_image`]: the metadata row for an
    /// already written blob.
    async fn record_image(&self, record: Image) -> Result<()> {
        let blob_id = record.blob_id;
        let inserted = self.with_db(move |db| db.insert_image(&record)).await;
        if let Err(e) = &inserted {
            self.note_orphan(blob_id, e);
        }
        inserted
    }

    /// The second-highest image of the group and its PNG bytes.
    ///
    /// `id` is the image the caller just stored; it does not narrow the
    /// query. If it is not the group's newest image the result is not "the
    /// image before `id`", which is logged.
    pub async fn get_image_before(&self, site: &str, group: &str, id: i64) -> Result<(i64, Vec<u8>)> {
        let (s, g) = (site.to_string(), group.to_string());
        let prior = self.with_db(move |db| db.get_image_before(&s, &g)).await?;
        if prior.id >= id {
            warn!(
                site,
                group,
                requested = id,
                returned = prior.id,
                "previous image is not older than the requested id"
            );
        }

        let bytes = self.blobs.get_blob(prior.blob_id).await?;
        debug!(site, group, id, prior = prior.id, "previous image loaded");
        Ok((prior.id, bytes))
    }

    // ------------------------------------------------------------------
    // Diffs
    // ------------------------------------------------------------------

    /// Record a precomputed diff. `diff_image` is `None` when there is no
    /// visualisation worth keeping (e.g. identical images).
    pub async fn store_diff_image(
        &self,
        site: &str,
        group: &str,
        id1: i64,
        id2: i64,
        pixel_diff_count: i64,
        diff_image: Option<&DynamicImage>,
    ) -> Result<()> {
        self.get_site(site).await?;

        let blob_id = match diff_image {
            Some(img) => Some(self.blobs.store_blob(&encode_png(img)?).await?),
            None => None,
        };

        self.record_diff(DiffImage {
            site: site.to_string(),
            group: group.to_string(),
            id1,
            id2,
            pixel_diff_count,
            blob_id,
            reviewed: false,
            created_at: Utc::now(),
        })
        .await?;

        info!(site, group, id1, id2, pixels = pixel_diff_count, "diff stored");
        Ok(())
    }

    /// Second phase of [`Backend::store_diff_image`]. Drops the blob of the
    /// diff it replaces, if any.
    async fn record_diff(&self, record: DiffImage) -> Result<()> {
        let blob_id = record.blob_id;
        let upserted = self.with_db(move |db| db.upsert_diff(&record)).await;
        match upserted {
            Ok(Some(replaced)) => {
                if let Err(e) = self.blobs.delete_blob(replaced).await {
                    self.note_orphan(replaced, &e);
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if let Some(blob_id) = blob_id {
                    self.note_orphan(blob_id, &e);
                }
                Err(e)
            }
        }
    }

    pub async fn get_unreviewed_images(&self, site: &str) -> Result<Vec<DiffSummary>> {
        let site = site.to_string();
        self.with_db(move |db| db.list_unreviewed(&site)).await
    }

    pub async fn mark_reviewed(&self, site: &str, group: &str, id1: i64, id2: i64) -> Result<bool> {
        let (site, group) = (site.to_string(), group.to_string());
        self.with_db(move |db| db.mark_reviewed(&site, &group, id1, id2))
            .await
    }

    // ------------------------------------------------------------------
    // Orphans
    // ------------------------------------------------------------------

    /// Blobs orphaned by failed metadata writes since startup.
    pub fn orphaned_blob_count(&self) -> u64 {
        self.orphans.load(Ordering::Relaxed)
    }

    /// Blobs on disk that no image or diff row references.
    pub async fn find_orphaned_blobs(&self) -> Result<Vec<Uuid>> {
        let on_disk = self.blobs.list_blobs().await?;
        let referenced = self.with_db(|db| db.referenced_blob_ids()).await?;
        let mut orphans: Vec<Uuid> = on_disk.difference(&referenced).copied().collect();
        orphans.sort();
        Ok(orphans)
    }

    fn note_orphan(&self, blob_id: Uuid, cause: &dyn std::error::Error) {
        self.orphans.fetch_add(1, Ordering::Relaxed);
        warn!(blob = %blob_id, error = %cause, "blob orphaned by failed write");
    }
}

async fn run_blocking<T, F>(op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> pdiff_store::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(ServiceError::Storage(format!("database task failed: {e}"))),
    }
}

/// Decode an uploaded image in any supported codec (PNG, JPEG, GIF).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| ServiceError::Storage(format!("PNG encode failed: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    use super::*;

    pub(crate) async fn test_backend() -> (Backend, TempDir) {
        test_backend_with_upload_limit(1024 * 1024).await
    }

    async fn test_backend_with_upload_limit(max_upload: usize) -> (Backend, TempDir) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("pdiff.db");
        Database::open_at(&db_path).unwrap();
        let blobs = BlobStore::new(dir.path().join("blobs"), 16 * 1024 * 1024)
            .await
            .unwrap();
        (Backend::new(db_path, blobs, max_upload), dir)
    }

    /// JPEG of RGB noise: compresses far worse as PNG than as JPEG.
    fn noise_jpeg(size: u32) -> Vec<u8> {
        let mut state: u32 = 0x2545_f491;
        let img = RgbImage::from_fn(size, size, |_, _| {
            let mut px = [0u8; 3];
            for channel in px.iter_mut() {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                *channel = state as u8;
            }
            Rgb(px)
        });

        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    pub(crate) fn solid(width: u32, height: u32, shade: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([shade, 0, 0])))
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        encode_png(img).unwrap()
    }

    #[tokio::test]
    async fn test_register_issues_credentials() {
        let (backend, _dir) = test_backend().await;
        let site = backend.register_site("demo").await.unwrap();
        assert_eq!(site.key.len(), 32);
        assert_eq!(site.secret.len(), 32);
        assert_ne!(site.key, site.secret);

        let stored = backend.get_site("demo").await.unwrap();
        assert_eq!(stored.key, site.key);
        assert_eq!(stored.secret, site.secret);

        assert!(matches!(
            backend.register_site("demo").await,
            Err(ServiceError::AlreadyExists)
        ));
        assert_eq!(backend.get_site("demo").await.unwrap().key, site.key);
    }

    #[tokio::test]
    async fn test_end_to_end_flow() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();
        backend.assign_key("demo", b"k1", b"s1").await.unwrap();

        let first = solid(4, 4, 10);
        let first_png = png_bytes(&first);
        let up1 = ImageUpload::signed(b"k1", b"s1", "demo", "g", 100, first_png.clone()).unwrap();
        backend.ingest_upload(&up1).await.unwrap();

        let up2 =
            ImageUpload::signed(b"k1", b"s1", "demo", "g", 200, png_bytes(&solid(4, 4, 20))).unwrap();
        backend.ingest_upload(&up2).await.unwrap();

        let (prior_id, prior_bytes) = backend.get_image_before("demo", "g", 200).await.unwrap();
        assert_eq!(prior_id, 100);
        // Stored re-encoded as PNG; a PNG input round-trips to the same pixels.
        assert_eq!(
            decode_image(&prior_bytes).unwrap().to_rgb8(),
            first.to_rgb8()
        );
        assert_eq!(prior_bytes, first_png);

        backend
            .store_diff_image("demo", "g", 100, 200, 42, None)
            .await
            .unwrap();
        let queue = backend.get_unreviewed_images("demo").await.unwrap();
        assert_eq!(
            queue,
            vec![DiffSummary {
                group: "g".to_string(),
                id1: 100,
                id2: 200,
                pixel_diff_count: 42,
            }]
        );

        assert!(backend.mark_reviewed("demo", "g", 100, 200).await.unwrap());
        assert!(backend.get_unreviewed_images("demo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_upload_never_stored() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();
        backend.assign_key("demo", b"k1", b"s1").await.unwrap();

        let forged =
            ImageUpload::signed(b"k1", b"wrong", "demo", "g", 1, png_bytes(&solid(2, 2, 1))).unwrap();
        assert!(matches!(
            backend.ingest_upload(&forged).await,
            Err(ServiceError::AuthenticationFailed)
        ));

        let mut wrong_key =
            ImageUpload::signed(b"k1", b"s1", "demo", "g", 1, png_bytes(&solid(2, 2, 1))).unwrap();
        wrong_key.key = b"k2".to_vec();
        assert!(matches!(
            backend.ingest_upload(&wrong_key).await,
            Err(ServiceError::AuthenticationFailed)
        ));

        let stored = backend
            .with_db(|db| db.image_exists("demo", "g", 1))
            .await
            .unwrap();
        assert!(!stored);
        assert!(backend.blobs.list_blobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_site_cannot_upload() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();

        let upload = ImageUpload::signed(&[], &[], "demo", "g", 1, png_bytes(&solid(1, 1, 0))).unwrap();
        assert!(matches!(
            backend.ingest_upload(&upload).await,
            Err(ServiceError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_undecodable_image() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();
        backend.assign_key("demo", b"k1", b"s1").await.unwrap();

        let upload = ImageUpload::signed(b"k1", b"s1", "demo", "g", 1, b"not an image".to_vec()).unwrap();
        assert!(matches!(
            backend.ingest_upload(&upload).await,
            Err(ServiceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_blob() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();
        backend.store_image("demo", "g", 5, &solid(2, 2, 1)).await.unwrap();

        assert!(matches!(
            backend.store_image("demo", "g", 5, &solid(2, 2, 2)).await,
            Err(ServiceError::AlreadyExists)
        ));
        assert_eq!(backend.blobs.list_blobs().await.unwrap().len(), 1);
        assert_eq!(backend.orphaned_blob_count(), 0);
    }

    #[tokio::test]
    async fn test_image_before_needs_two() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();
        assert!(matches!(
            backend.get_image_before("demo", "g", 1).await,
            Err(ServiceError::NotFound)
        ));

        for id in [1, 2, 3] {
            backend.store_image("demo", "g", id, &solid(1, 1, id as u8)).await.unwrap();
        }
        let (prior, _) = backend.get_image_before("demo", "g", 3).await.unwrap();
        assert_eq!(prior, 2);
    }

    #[tokio::test]
    async fn test_image_for_unknown_site() {
        let (backend, _dir) = test_backend().await;
        assert!(matches!(
            backend.store_image("ghost", "g", 1, &solid(1, 1, 0)).await,
            Err(ServiceError::NotFound)
        ));
        assert!(backend.blobs.list_blobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_diff_blob_replaced_and_orphans_found() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();

        let diff = solid(2, 2, 255);
        backend
            .store_diff_image("demo", "g", 1, 2, 4, Some(&diff))
            .await
            .unwrap();
        backend
            .store_diff_image("demo", "g", 1, 2, 3, Some(&diff))
            .await
            .unwrap();

        // The first visualisation was dropped when the pair was re-stored.
        assert_eq!(backend.blobs.list_blobs().await.unwrap().len(), 1);
        assert!(backend.find_orphaned_blobs().await.unwrap().is_empty());

        let stray = backend.blobs.store_blob(b"stray").await.unwrap();
        assert_eq!(backend.find_orphaned_blobs().await.unwrap(), vec![stray]);
    }

    #[tokio::test]
    async fn test_diff_for_unknown_site_writes_no_blob() {
        let (backend, _dir) = test_backend().await;
        let result = backend
            .store_diff_image("ghost", "g", 1, 2, 4, Some(&solid(1, 1, 1)))
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound)));
        assert!(backend.blobs.list_blobs().await.unwrap().is_empty());
        assert_eq!(backend.orphaned_blob_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_diff_write_counts_orphan() {
        let (backend, _dir) = test_backend().await;
        let blob_id = backend.blobs.store_blob(b"diff").await.unwrap();

        let result = backend
            .record_diff(DiffImage {
                site: "ghost".to_string(),
                group: "g".to_string(),
                id1: 1,
                id2: 2,
                pixel_diff_count: 4,
                blob_id: Some(blob_id),
                reviewed: false,
                created_at: Utc::now(),
            })
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound)));
        assert_eq!(backend.orphaned_blob_count(), 1);
        assert_eq!(backend.find_orphaned_blobs().await.unwrap(), vec![blob_id]);
    }

    #[tokio::test]
    async fn test_failed_image_write_counts_orphan() {
        let (backend, _dir) = test_backend().await;
        backend.create_site("demo").await.unwrap();
        backend.store_image("demo", "g", 5, &solid(2, 2, 1)).await.unwrap();

        // A concurrent writer claimed id 5 between the pre-check and the
        // metadata insert.
        let blob_id = backend
            .blobs
            .store_blob(&png_bytes(&solid(2, 2, 2)))
            .await
            .unwrap();
        let result = backend
            .record_image(Image {
                site: "demo".to_string(),
                group: "g".to_string(),
                id: 5,
                width: 2,
                height: 2,
                blob_id,
                created_at: Utc::now(),
            })
            .await;

        assert!(matches!(result, Err(ServiceError::AlreadyExists)));
        assert_eq!(backend.orphaned_blob_count(), 1);
        assert_eq!(backend.find_orphaned_blobs().await.unwrap(), vec![blob_id]);
    }

    #[tokio::test]
    async fn test_upload_cap_applies_to_uploaded_bytes() {
        let jpeg = noise_jpeg(256);
        let png_len = encode_png(&decode_image(&jpeg).unwrap()).unwrap().len();
        assert!(png_len > jpeg.len());

        let (backend, _dir) = test_backend_with_upload_limit(jpeg.len()).await;
        let site = backend.register_site("demo").await.unwrap();

        let upload =
            ImageUpload::signed(&site.key, &site.secret, "demo", "g", 1, jpeg.clone()).unwrap();
        backend.ingest_upload(&upload).await.unwrap();

        let mut oversized = jpeg;
        oversized.push(0);
        let max = oversized.len() - 1;
        let upload =
            ImageUpload::signed(&site.key, &site.secret, "demo", "g", 2, oversized).unwrap();
        assert!(matches!(
            backend.ingest_upload(&upload).await,
            Err(ServiceError::BlobTooLarge { max: m, .. }) if m == max
        ));
        assert_eq!(backend.blobs.list_blobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reads_not_blocked_by_another_sites_write() {
        let (backend, dir) = test_backend().await;
        backend.create_site("a").await.unwrap();
        backend.create_site("b").await.unwrap();

        let writer = Database::connect(&dir.path().join("pdiff.db")).unwrap();
        writer
            .conn()
            .execute_batch("BEGIN IMMEDIATE; UPDATE sites SET key_hex = 'aa' WHERE name = 'a';")
            .unwrap();

        let site = tokio::time::timeout(Duration::from_secs(2), backend.get_site("b"))
            .await
            .expect("read waited on the writer")
            .unwrap();
        assert_eq!(site.name, "b");

        writer.conn().execute_batch("ROLLBACK").unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_uploads_across_sites() {
        let (backend, _dir) = test_backend().await;

        let mut tasks = Vec::new();
        for n in 0..8u8 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("site-{n}");
                backend.create_site(&name).await?;
                for id in 1..=3 {
                    backend.store_image(&name, "g", id, &solid(2, 2, n)).await?;
                }
                backend.get_image_before(&name, "g", 3).await
            }));
        }

        for task in tasks {
            let (prior, _) = task.await.unwrap().unwrap();
            assert_eq!(prior, 2);
        }
    }
}
