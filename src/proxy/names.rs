use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::Regex;
use std::sync::LazyLock;

use crate::oci::Digest;

static GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]+(?:[._-][A-Za-z0-9]+)*(?:/[A-Za-z0-9]+(?:[._-][A-Za-z0-9]+)*)*$")
        .unwrap()
});

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
        .unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w[\w.-]{0,127}$").unwrap());

pub fn is_valid_group(group: &str) -> bool {
    GROUP_RE.is_match(group)
}

pub fn is_valid_image(image: &str) -> bool {
    image.len() <= 255 && IMAGE_RE.is_match(image)
}

/// A manifest reference is either a tag or a digest.
pub fn is_valid_tag(tag: &str) -> bool {
    TAG_RE.is_match(tag) || tag.parse::<Digest>().is_ok()
}

pub fn blob_file_name(digest: &Digest) -> String {
    format!("{}.gz", digest.hash())
}

pub fn manifest_file_name(image: &str, tag: &str) -> String {
    format!("{image}:{tag}.json")
}

pub fn blob_handle(group: &str, file_name: &str) -> String {
    format!("{group}/blobs/{file_name}")
}

/// Manifest content is addressed by digest so that a record never points at
/// bytes of another revision.
pub fn manifest_handle(group: &str, file_name: &str, digest: &Digest) -> String {
    let key = URL_SAFE_NO_PAD.encode(file_name);
    format!("{group}/manifests/{key}/{}", digest.hash())
}
