// src/mxc.rs
use url::Url;

/// Splits `mxc://server/media_id` into its two parts.
fn split_mxc(mxc: &str) -> Option<(&str, &str)> {
    let rest = mxc.strip_prefix("mxc://")?;
    let (server, media_id) = rest.split_once('/')?;
    if server.is_empty() || media_id.is_empty() {
        return None;
    }
    Some((server, media_id))
}

fn media_url(media_base: &str, kind: &str, server: &str, media_id: &str) -> Option<Url> {
    let mut url = Url::parse(media_base).ok()?;
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(["_matrix", "media", "r0", kind, server, media_id]);
    Some(url)
}

/// Full-size download URL for a content URI on the configured media host.
pub fn download_url(mxc: &str, media_base: &str) -> Option<String> {
    let (server, media_id) = split_mxc(mxc)?;
    media_url(media_base, "download", server, media_id).map(String::from)
}

/// Thumbnail URL, e.g. the 60x60 crops used by the room directory.
pub fn thumbnail_url(mxc: &str, media_base: &str, width: u32, height: u32, method: &str) -> Option<String> {
    let (server, media_id) = split_mxc(mxc)?;
    let mut url = media_url(media_base, "thumbnail", server, media_id)?;
    url.query_pairs_mut()
        .append_pair("width", &width.to_string())
        .append_pair("height", &height.to_string())
        .append_pair("method", method);
    Some(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_download_and_thumbnail_urls() {
        assert_eq!(
            download_url("mxc://example.org/abc", "https://media.example.org").as_deref(),
            Some("https://media.example.org/_matrix/media/r0/download/example.org/abc")
        );
        assert_eq!(
            thumbnail_url("mxc://example.org/abc", "https://media.example.org/", 60, 60, "crop").as_deref(),
            Some("https://media.example.org/_matrix/media/r0/thumbnail/example.org/abc?width=60&height=60&method=crop")
        );
    }

    #[test]
    fn rejects_non_mxc_input() {
        assert_eq!(download_url("https://example.org/a.png", "https://hs"), None);
        assert_eq!(download_url("mxc://example.org", "https://hs"), None);
        assert_eq!(download_url("", "https://hs"), None);
    }
}
