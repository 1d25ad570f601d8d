//! Mock chapter site and image generators

use chapter_dl::{ChapterRef, StaticCatalog};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Encode a noisy RGB PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        let v = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503) ^ (x * y);
        image::Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
    });
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("PNG encoding failed");
    buf.into_inner()
}

/// Path of a chapter's page list on the mock site
pub fn chapter_path(owner_id: &str, unit_key: &str) -> String {
    format!("/{}/{}/pages.json", owner_id, unit_key)
}

/// Path of one page image on the mock site
pub fn page_path(owner_id: &str, unit_key: &str, index: usize) -> String {
    format!("/{}/{}/{}.png", owner_id, unit_key, index)
}

/// Serve a chapter of `pages` PNG pages and return its catalog entry
pub async fn mount_chapter(
    server: &MockServer,
    owner_id: &str,
    unit_key: &str,
    pages: usize,
) -> ChapterRef {
    mount_chapter_with_delay(server, owner_id, unit_key, pages, Duration::ZERO).await
}

/// Like [`mount_chapter`], with every image response delayed
pub async fn mount_chapter_with_delay(
    server: &MockServer,
    owner_id: &str,
    unit_key: &str,
    pages: usize,
    delay: Duration,
) -> ChapterRef {
    // relative entries are resolved against the page list URL
    let urls: Vec<String> = (0..pages).map(|i| format!("{}.png", i)).collect();
    Mock::given(method("GET"))
        .and(path(chapter_path(owner_id, unit_key)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(urls)))
        .mount(server)
        .await;

    for index in 0..pages {
        Mock::given(method("GET"))
            .and(path(page_path(owner_id, unit_key, index)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(png_bytes(48, 64 + index as u32))
                    .insert_header("content-type", "image/png")
                    .set_delay(delay),
            )
            .mount(server)
            .await;
    }

    chapter_ref(server, owner_id, unit_key)
}

/// Answer the chapter's page list with 404 for the first `times` requests
pub async fn mount_missing_chapter(
    server: &MockServer,
    owner_id: &str,
    unit_key: &str,
    times: u64,
) -> ChapterRef {
    Mock::given(method("GET"))
        .and(path(chapter_path(owner_id, unit_key)))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(times)
        .with_priority(1)
        .mount(server)
        .await;
    chapter_ref(server, owner_id, unit_key)
}

/// Catalog entry for a chapter on the mock site
pub fn chapter_ref(server: &MockServer, owner_id: &str, unit_key: &str) -> ChapterRef {
    ChapterRef::new(
        unit_key,
        format!("{}{}", server.uri(), chapter_path(owner_id, unit_key)),
        format!("Chapter {}", unit_key),
    )
}

/// Catalog holding one title
pub fn catalog(owner_id: &str, chapters: Vec<ChapterRef>) -> StaticCatalog {
    StaticCatalog::new().with_title(owner_id, chapters)
}

/// How many requests the mock site received for `request_path`
pub async fn request_count(server: &MockServer, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == request_path)
        .count()
}
