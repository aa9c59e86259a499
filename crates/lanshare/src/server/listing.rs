//! HTML index pages for shared directories that have no `index.html`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use tracing::debug;

/// Answers `GET`/`HEAD` on a directory path ending in `/` with a listing of
/// its entries. Requests that do not name such a directory, or name one that
/// holds an `index.html`, are passed on unchanged.
pub(crate) async fn list_directories(
    State(root): State<Arc<PathBuf>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if !matches!(*request.method(), Method::GET | Method::HEAD) || !path.ends_with('/') {
        return next.run(request).await;
    }

    let Some((dir, title)) = resolve(&root, &path) else {
        return next.run(request).await;
    };
    if !is_dir(&dir).await || is_file(&dir.join("index.html")).await {
        return next.run(request).await;
    }

    match render(&dir, &title).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            debug!("Failed to list {:?}: {}", dir, e);
            next.run(request).await
        }
    }
}

/// Maps a request path onto a directory below `root`, together with the
/// decoded path for display. Anything other than plain names is refused.
fn resolve(root: &Path, request_path: &str) -> Option<(PathBuf, String)> {
    let decoded = percent_decode(request_path)?;
    let mut dir = root.to_path_buf();

    for segment in decoded.split('/').filter(|s| !s.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => dir.push(part),
            _ => return None,
        }
    }

    Some((dir, decoded))
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

struct Entry {
    name: String,
    is_dir: bool,
    is_link: bool,
}

async fn render(dir: &Path, title: &str) -> std::io::Result<String> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        let is_link = entry.file_type().await?.is_symlink();
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: is_dir(&entry.path()).await,
            is_link,
        });
    }
    entries.sort_by_key(|e| e.name.to_lowercase());

    let title = escape_html(title);
    let mut page = format!(
        "<!DOCTYPE HTML>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Directory listing for {title}</title>\n</head>\n<body>\n\
         <h1>Directory listing for {title}</h1>\n<hr>\n<ul>\n"
    );

    for entry in &entries {
        let mut display = entry.name.clone();
        let mut link = entry.name.clone();
        if entry.is_dir {
            display.push('/');
            link.push('/');
        }
        if entry.is_link {
            display.push('@');
        }
        page.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            encode_link(&link),
            escape_html(&display)
        ));
    }

    page.push_str("</ul>\n<hr>\n</body>\n</html>\n");
    Ok(page)
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(decoded).ok()
}

fn encode_link(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                result.push(b as char)
            }
            _ => result.push_str(&format!("%{:02X}", b)),
        }
    }
    result
}

fn escape_html(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#x27;"),
            _ => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_stays_below_root() {
        let root = Path::new("/srv/share");

        let (dir, title) = resolve(root, "/docs/my%20notes/").unwrap();
        assert_eq!(dir, root.join("docs").join("my notes"));
        assert_eq!(title, "/docs/my notes/");

        assert!(resolve(root, "/../").is_none());
        assert!(resolve(root, "/docs/%2E%2E/").is_none());
        assert!(resolve(root, "/./").is_none());
    }

    #[test]
    fn test_percent_decode_rejects_malformed_escapes() {
        assert_eq!(percent_decode("/a%2Fb").as_deref(), Some("/a/b"));
        assert!(percent_decode("/a%2").is_none());
        assert!(percent_decode("/a%+1").is_none());
        assert!(percent_decode("/%FF").is_none());
    }

    #[test]
    fn test_names_are_escaped_and_encoded() {
        assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#x27;x&#x27;&gt;&amp;&lt;/a&gt;");
        assert_eq!(encode_link("my file#1.txt"), "my%20file%231.txt");
        assert_eq!(encode_link("docs/"), "docs/");
    }

    #[tokio::test]
    async fn test_render_sorts_and_marks_directories() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(temp_dir.path().join("A.txt"), "a").unwrap();
        std::fs::create_dir(temp_dir.path().join("docs")).unwrap();

        let page = render(temp_dir.path(), "/").await.unwrap();

        assert!(page.contains("<title>Directory listing for /</title>"));
        let a = page.find("<a href=\"A.txt\">A.txt</a>").unwrap();
        let b = page.find("<a href=\"b.txt\">b.txt</a>").unwrap();
        let docs = page.find("<a href=\"docs/\">docs/</a>").unwrap();
        assert!(a < b && b < docs);
    }
}
