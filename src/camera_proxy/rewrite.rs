//! Camera web-UI rewriting
//!
//! Same-origin references in relayed HTML/CSS (and HLS playlists) are
//! re-pointed at the proxy so the browser never contacts the camera
//! directly. The page URL travels along as `url=`, the original reference
//! as `asset=`.

/// Extension -> outbound content type for relayed web-UI assets
pub fn content_type_for_path(path: &str) -> Option<&'static str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;

    let content_type = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" | "map" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        _ => return None,
    };
    Some(content_type)
}

/// Whether a body of this type gets its references rewritten
pub fn is_rewritable_markup(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/html") || ct.starts_with("text/css")
}

pub fn is_playlist(content_type: &str, path: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("mpegurl") || path.to_ascii_lowercase().ends_with(".m3u8")
}

/// Proxy URL for one asset reference
pub fn proxied_asset_url(public_path: &str, page_url: &str, asset: &str) -> String {
    format!(
        "{}?url={}&asset={}",
        public_path,
        urlencoding::encode(page_url),
        urlencoding::encode(asset)
    )
}

/// Same-origin reference check: relative or root-relative paths only
fn is_same_origin_ref(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() || v.starts_with('#') || v.starts_with("//") {
        return false;
    }
    // any `scheme:` prefix (http:, data:, javascript:, mailto:, ...)
    if let Some(colon) = v.find(':') {
        let scheme = &v[..colon];
        let looks_like_scheme = scheme
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic())
            .unwrap_or(false)
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if looks_like_scheme {
            return false;
        }
    }
    true
}

fn starts_with_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack[..needle.len()].eq_ignore_ascii_case(needle)
}

/// Value span following `href=` / `src=`
fn attr_value_span(bytes: &[u8], mut j: usize) -> Option<(usize, usize)> {
    let quote = *bytes.get(j)?;
    if quote == b'"' || quote == b'\'' {
        j += 1;
        let len = bytes[j..].iter().position(|&b| b == quote)?;
        return Some((j, j + len));
    }
    let len = bytes[j..]
        .iter()
        .position(|&b| b.is_ascii_whitespace() || b == b'>')
        .unwrap_or(bytes.len() - j);
    (len > 0).then_some((j, j + len))
}

/// Value span inside `url( ... )`
fn css_value_span(bytes: &[u8], mut j: usize) -> Option<(usize, usize)> {
    while bytes.get(j).map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
        j += 1;
    }
    let first = *bytes.get(j)?;
    if first == b'"' || first == b'\'' {
        j += 1;
        let len = bytes[j..].iter().position(|&b| b == first)?;
        return Some((j, j + len));
    }
    let len = bytes[j..].iter().position(|&b| b == b')')?;
    let mut end = j + len;
    while end > j && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (end > j).then_some((j, end))
}

fn reference_at(bytes: &[u8], i: usize) -> Option<(usize, usize)> {
    let rest = &bytes[i..];
    let at_boundary = i == 0 || bytes[i - 1].is_ascii_whitespace();

    for attr in [b"href=".as_slice(), b"src=".as_slice()] {
        if at_boundary && starts_with_ignore_case(rest, attr) {
            return attr_value_span(bytes, i + attr.len());
        }
    }
    if starts_with_ignore_case(rest, b"url(") {
        return css_value_span(bytes, i + 4);
    }
    None
}

/// Rewrite `href=`, `src=` and CSS `url(...)` references
pub fn rewrite_asset_refs(body: &str, page_url: &str, public_path: &str) -> String {
    let bytes = body.as_bytes();
    let mut out = String::with_capacity(body.len() + body.len() / 8);
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match reference_at(bytes, i) {
            Some((start, end)) => {
                let value = &body[start..end];
                if is_same_origin_ref(value) {
                    out.push_str(&body[copied..start]);
                    out.push_str(&proxied_asset_url(public_path, page_url, value.trim()));
                    copied = end;
                }
                i = end.max(i + 1);
            }
            None => i += 1,
        }
    }

    out.push_str(&body[copied..]);
    out
}

/// Rewrite segment/variant URIs in an HLS playlist
pub fn rewrite_playlist(body: &str, playlist_url: &str, public_path: &str) -> String {
    body.lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || !is_same_origin_ref(trimmed) {
                line.to_string()
            } else {
                proxied_asset_url(public_path, playlist_url, trimmed)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "http://10.0.0.5/index.html";

    #[test]
    fn test_rewrites_relative_and_root_relative() {
        let html = r#"<link href="static/app.css"><script src='/js/main.js'></script>"#;
        let out = rewrite_asset_refs(html, PAGE, "/camera-proxy");

        assert!(out.contains(
            r#"href="/camera-proxy?url=http%3A%2F%2F10.0.0.5%2Findex.html&asset=static%2Fapp.css""#
        ));
        assert!(out.contains("asset=%2Fjs%2Fmain.js'"));
    }

    #[test]
    fn test_leaves_external_and_special_refs() {
        let html = concat!(
            r#"<a href="https://example.com/x">x</a>"#,
            r##"<a href="#top">t</a>"##,
            r#"<img src="data:image/png;base64,AAAA">"#,
            r#"<script src="//cdn.example.com/lib.js"></script>"#,
            r#"<a href="javascript:void(0)">j</a>"#
        );
        assert_eq!(rewrite_asset_refs(html, PAGE, "/camera-proxy"), html);
    }

    #[test]
    fn test_ignores_data_attributes() {
        let html = r#"<img data-src="static/lazy.png">"#;
        assert_eq!(rewrite_asset_refs(html, PAGE, "/camera-proxy"), html);
    }

    #[test]
    fn test_unquoted_attribute() {
        let html = "<img src=static/logo.png alt=x>";
        let out = rewrite_asset_refs(html, PAGE, "/p");
        assert!(out.starts_with("<img src=/p?url="));
        assert!(out.ends_with("asset=static%2Flogo.png alt=x>"));
    }

    #[test]
    fn test_css_url_forms() {
        let css = r#"a{background:url(static/bg.png)} b{src:url( "fonts/x.woff2" )}"#;
        let out = rewrite_asset_refs(css, "http://10.0.0.5/static/app.css", "/p");
        assert!(out.contains("url(/p?url=http%3A%2F%2F10.0.0.5%2Fstatic%2Fapp.css&asset=static%2Fbg.png)"));
        assert!(out.contains(r#"url( "/p?url="#));
        assert!(out.contains(r#"asset=fonts%2Fx.woff2" )"#));
    }

    #[test]
    fn test_non_ascii_body_survives() {
        let html = "<p>Cámara</p><img src=\"a.png\">ü";
        let out = rewrite_asset_refs(html, PAGE, "/p");
        assert!(out.starts_with("<p>Cámara</p>"));
        assert!(out.ends_with("ü"));
    }

    #[test]
    fn test_playlist_segments_rewritten() {
        let playlist = "#EXTM3U\n#EXTINF:2.0,\nseg1.ts\nhttp://other/seg2.ts";
        let out = rewrite_playlist(playlist, "http://10.0.0.5/live.m3u8", "/p");
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[2], "/p?url=http%3A%2F%2F10.0.0.5%2Flive.m3u8&asset=seg1.ts");
        assert_eq!(lines[3], "http://other/seg2.ts");
    }

    #[test]
    fn test_content_type_table() {
        assert_eq!(content_type_for_path("/static/app.css"), Some("text/css"));
        assert_eq!(content_type_for_path("a/b/bundle.js.map"), Some("application/json"));
        assert_eq!(content_type_for_path("/f/x.WOFF2"), Some("font/woff2"));
        assert_eq!(content_type_for_path("/cgi-bin/mjpeg"), None);
        assert_eq!(content_type_for_path("/v1.2/stream"), None);
    }
}
