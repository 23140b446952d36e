use bytes::Bytes;
use std::{collections::BTreeMap, future::Future};

use crate::error::FailureReason;

/// Largest page a single ListObjectsV2 call returns.
pub const MAX_LIST_KEYS: usize = 1000;

/// Keys found below a prefix. `truncated` means more exist than were
/// returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Listing {
    pub keys: Vec<String>,
    pub truncated: bool,
}

/// Headers every uploaded object carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub content_type: String,
    pub cache_control: String,
    pub content_disposition: String,
    pub acl: String,
    /// User metadata, sent as `x-amz-meta-<key>`.
    pub metadata: BTreeMap<String, String>,
}

/// A single-request upload.
#[derive(Clone, Debug)]
pub struct PutObject {
    pub key: String,
    pub headers: ObjectHeaders,
    /// Base64 MD5 of `body`.
    pub content_md5: String,
    pub body: Bytes,
}

/// A finished part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// The subset of an S3-compatible API the publisher needs.
///
/// Every failure is already mapped onto the [`FailureReason`] taxonomy, so
/// retry decisions stay in the publisher.
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket, recorded in resume state.
    fn bucket(&self) -> &str;

    /// Checks the bucket exists and the credentials may use it.
    fn head_bucket(&self) -> impl Future<Output = Result<(), FailureReason>> + Send;

    /// Up to `max_keys` keys below `prefix`, following continuation tokens.
    fn list_prefix(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> impl Future<Output = Result<Listing, FailureReason>> + Send;

    /// `Ok(false)` when the object does not exist.
    fn head_object(&self, key: &str) -> impl Future<Output = Result<bool, FailureReason>> + Send;

    fn put_object(
        &self,
        request: PutObject,
    ) -> impl Future<Output = Result<(), FailureReason>> + Send;

    /// Starts a multipart upload and returns its upload id.
    fn create_multipart(
        &self,
        key: &str,
        headers: &ObjectHeaders,
    ) -> impl Future<Output = Result<String, FailureReason>> + Send;

    /// Uploads one part and returns its ETag.
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> impl Future<Output = Result<String, FailureReason>> + Send;

    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> impl Future<Output = Result<(), FailureReason>> + Send;

    fn abort_multipart(
        &self,
        key: &str,
        upload_id: &str,
    ) -> impl Future<Output = Result<(), FailureReason>> + Send;
}
