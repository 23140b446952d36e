//! In-memory stand-ins for the tile server and the object store.

#![allow(dead_code)]

use bytes::Bytes;
use planning_tile_harvester::{
    publish::{CompletedPart, Listing, ObjectHeaders, ObjectStore, PutObject},
    FailureReason, TemplateRegistry, TileResponse, TileSource,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};
use tokio::time::Instant;

/// Smallest body the fetcher accepts: a PNG signature padded past the
/// placeholder threshold.
pub fn png_tile() -> Vec<u8> {
    let mut body = b"\x89PNG\r\n\x1a\n".to_vec();
    body.resize(200, 0);
    body
}

pub fn png_response() -> TileResponse {
    TileResponse::from_bytes(200, Some("image/png"), png_tile())
}

type Responder = dyn Fn(&str, u32) -> Result<TileResponse, FailureReason> + Send + Sync;

/// Answers every request through a closure receiving the URL and how many
/// times that URL was requested before.
pub struct ScriptedSource {
    respond: Box<Responder>,
    calls: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedSource {
    pub fn new(
        respond: impl Fn(&str, u32) -> Result<TileResponse, FailureReason> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Serves a valid PNG for every URL.
    pub fn serving_png() -> Self {
        Self::new(|_, _| Ok(png_response()))
    }

    pub fn requests(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }
}

impl TileSource for ScriptedSource {
    async fn get(&self, url: &str) -> Result<TileResponse, FailureReason> {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(url.to_owned()).or_default();
            let previous = *count;
            *count += 1;
            previous
        };
        self.log
            .lock()
            .unwrap()
            .push((url.to_owned(), Instant::now()));

        (self.respond)(url, previous)
    }
}

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub headers: ObjectHeaders,
    pub content_md5: Option<String>,
    pub body: Bytes,
}

struct MultipartUpload {
    key: String,
    headers: ObjectHeaders,
    parts: BTreeMap<u32, Bytes>,
}

/// A bucket held in memory.
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, MultipartUpload>>,
    put_failures: Mutex<HashMap<String, VecDeque<FailureReason>>>,
    list_failure: Mutex<Option<FailureReason>>,
    reachable: bool,
    pub puts: AtomicUsize,
    pub heads: AtomicUsize,
    pub lists: AtomicUsize,
    pub aborts: AtomicUsize,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            put_failures: Mutex::new(HashMap::new()),
            list_failure: Mutex::new(None),
            reachable: true,
            puts: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    pub fn unreachable(bucket: &str) -> Self {
        Self {
            reachable: false,
            ..Self::new(bucket)
        }
    }

    /// Pretends `key` was uploaded before.
    pub fn seed(&self, key: &str) {
        self.objects.lock().unwrap().insert(
            key.to_owned(),
            StoredObject {
                headers: ObjectHeaders {
                    content_type: "image/png".into(),
                    cache_control: String::new(),
                    content_disposition: String::new(),
                    acl: String::new(),
                    metadata: BTreeMap::new(),
                },
                content_md5: None,
                body: Bytes::new(),
            },
        );
    }

    /// The next PUTs of `key` fail with these reasons, in order.
    pub fn fail_puts(&self, key: &str, reasons: Vec<FailureReason>) {
        self.put_failures
            .lock()
            .unwrap()
            .insert(key.to_owned(), reasons.into());
    }

    pub fn fail_listings(&self, reason: FailureReason) {
        *self.list_failure.lock().unwrap() = Some(reason);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_bucket(&self) -> Result<(), FailureReason> {
        if self.reachable {
            Ok(())
        } else {
            Err(FailureReason::HttpStatus { code: 404 })
        }
    }

    async fn list_prefix(&self, prefix: &str, max_keys: usize) -> Result<Listing, FailureReason> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.list_failure.lock().unwrap().clone() {
            return Err(reason);
        }

        let objects = self.objects.lock().unwrap();
        let matching: Vec<String> = objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        Ok(Listing {
            truncated: matching.len() > max_keys,
            keys: matching.into_iter().take(max_keys).collect(),
        })
    }

    async fn head_object(&self, key: &str) -> Result<bool, FailureReason> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn put_object(&self, request: PutObject) -> Result<(), FailureReason> {
        self.puts.fetch_add(1, Ordering::SeqCst);

        let failure = self
            .put_failures
            .lock()
            .unwrap()
            .get_mut(&request.key)
            .and_then(VecDeque::pop_front);
        if let Some(reason) = failure {
            return Err(reason);
        }

        self.objects.lock().unwrap().insert(
            request.key,
            StoredObject {
                headers: request.headers,
                content_md5: Some(request.content_md5),
                body: request.body,
            },
        );
        Ok(())
    }

    async fn create_multipart(
        &self,
        key: &str,
        headers: &ObjectHeaders,
    ) -> Result<String, FailureReason> {
        let mut uploads = self.uploads.lock().unwrap();
        let id = format!("upload-{}", uploads.len() + 1);
        uploads.insert(
            id.clone(),
            MultipartUpload {
                key: key.to_owned(),
                headers: headers.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, FailureReason> {
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or(FailureReason::HttpStatus { code: 404 })?;
        upload.parts.insert(part_number, body);
        Ok(format!("\"etag-{}\"", part_number))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), FailureReason> {
        let upload = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or(FailureReason::HttpStatus { code: 404 })?;
        if upload.key != key || parts.len() != upload.parts.len() {
            return Err(FailureReason::HttpStatus { code: 400 });
        }

        let mut body = Vec::new();
        for part in upload.parts.values() {
            body.extend_from_slice(part);
        }

        self.objects.lock().unwrap().insert(
            key.to_owned(),
            StoredObject {
                headers: upload.headers,
                content_md5: None,
                body: body.into(),
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), FailureReason> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().unwrap().remove(upload_id);
        Ok(())
    }
}

/// Writes a tile file below `root` the way the fetcher lays them out.
pub fn write_tile(root: &Path, relative: &str, body: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

pub const HANOI: (f64, f64) = (21.0285, 105.8542);
pub const BACKAN: (f64, f64) = (22.1470, 105.8348);

pub fn registry(json: &str) -> TemplateRegistry {
    TemplateRegistry::from_json(json).unwrap()
}

/// Hanoi with one master-plan template.
pub fn hanoi_registry() -> TemplateRegistry {
    registry(&format!(
        r#"{{ "regions": [{{
            "id": "hanoi",
            "centroid": {{ "lat": {}, "lon": {} }},
            "radius_km": 5,
            "variants": {{
                "qh-2030": {{ "templates": ["https://tiles.example.vn/hanoi/qh-2030/{{z}}/{{x}}/{{y}}.png"] }}
            }}
        }}] }}"#,
        HANOI.0, HANOI.1
    ))
}

/// Bac Kan with a per-district annual plan for two districts.
pub fn backan_registry() -> TemplateRegistry {
    registry(&format!(
        r#"{{ "regions": [{{
            "id": "backan",
            "centroid": {{ "lat": {}, "lon": {} }},
            "radius_km": 5,
            "variants": {{
                "kh-2025": {{ "by_subregion": {{
                    "huyen-a": {{ "templates": ["https://tiles.example.vn/kh-2025/huyen-a/{{z}}/{{x}}/{{y}}.png"] }},
                    "huyen-b": {{ "templates": ["https://tiles.example.vn/kh-2025/huyen-b/{{z}}/{{x}}/{{y}}.png"] }}
                }} }}
            }}
        }}] }}"#,
        BACKAN.0, BACKAN.1
    ))
}
