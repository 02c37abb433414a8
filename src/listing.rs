use std::fmt::Write;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use thiserror::Error;

use crate::error::AppError;
use crate::handlers::{file_response, method_not_allowed};
use crate::models::{FileEntry, PageData};
use crate::paths::ResolvedPath;
use crate::storage::human_readable_size;

use crate::AppState;

const BROWSE_PREFIX: &str = "/browse";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("page formatting failed")]
    Format(#[from] std::fmt::Error),
}

/// Turns one directory listing into a complete page. The whole page is produced before
/// anything is written to the client.
pub trait PageRenderer: Send + Sync {
    fn render(&self, page: &PageData) -> Result<String, RenderError>;
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(|| async { Redirect::to(BROWSE_PREFIX) }).fallback(method_not_allowed))
        .route("/browse", get(browse_root).fallback(method_not_allowed))
        .route("/browse/", get(browse_root).fallback(method_not_allowed))
        .route("/browse/*path", get(browse).fallback(method_not_allowed))
}

async fn browse_root(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    render_path(&state, "").await
}

async fn browse(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    render_path(&state, &path).await
}

/// A directory renders as a page, a file streams as an attachment.
async fn render_path(state: &AppState, request_path: &str) -> Result<Response, AppError> {
    let target = state.storage.resolve(request_path)?;
    let meta = state.storage.stat(&target).await?;
    if !meta.is_dir() {
        return file_response(&state.storage, &target).await;
    }

    let children = state.storage.list_children(&target).await?;
    let page = PageData {
        path: target.relative.clone(),
        items: listing_entries(&target, children),
    };

    let html = state
        .renderer
        .render(&page)
        .map_err(|e| AppError::internal("failed to render directory page", e))?;
    Ok(Html(html).into_response())
}

/// Directories first, OS order otherwise, with a leading ".." below the root.
pub fn listing_entries(dir: &ResolvedPath, mut children: Vec<FileEntry>) -> Vec<FileEntry> {
    // sort_by_key is stable, so ties keep the read_dir order
    children.sort_by_key(|entry| !entry.is_dir);

    let mut items = Vec::with_capacity(children.len() + 1);
    if !dir.is_root() {
        let parent = dir
            .relative
            .rsplit_once('/')
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_default();
        items.push(FileEntry::parent_link(parent));
    }
    items.extend(children);
    items
}

/// Link target for an entry's href under the browse prefix.
fn browse_link(href: &str) -> String {
    if href.is_empty() {
        return BROWSE_PREFIX.to_string();
    }
    let encoded: Vec<String> = href
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", BROWSE_PREFIX, encoded.join("/"))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Built-in HTML listing page
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlListing;

impl PageRenderer for HtmlListing {
    fn render(&self, page: &PageData) -> Result<String, RenderError> {
        let mut rows = String::new();
        for item in &page.items {
            let (icon, size) = if item.is_dir {
                ("📁", "-".to_string())
            } else {
                ("📄", item.size.map(human_readable_size).unwrap_or_default())
            };
            write!(
                rows,
                r#"
            <tr>
                <td class="icon">{icon}</td>
                <td class="name"><a href="{link}">{name}{slash}</a></td>
                <td class="size">{size}</td>
            </tr>"#,
                icon = icon,
                link = escape_html(&browse_link(&item.href)),
                name = escape_html(&item.name),
                slash = if item.is_dir && item.name != ".." { "/" } else { "" },
                size = size,
            )?;
        }

        if page.items.is_empty() {
            rows.push_str(
                r#"
            <tr><td colspan="3" class="empty">This directory is empty</td></tr>"#,
            );
        }

        let title = format!("/{}", page.path);
        let mut html = String::new();
        write!(
            html,
            r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Index of {title}</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif; margin: 2rem; color: #1f2937; }}
        h1 {{ font-size: 1.25rem; font-weight: 600; }}
        table {{ border-collapse: collapse; width: 100%; max-width: 960px; }}
        td {{ padding: 0.4rem 0.6rem; border-bottom: 1px solid #e5e7eb; }}
        td.icon {{ width: 1.5rem; }}
        td.size {{ text-align: right; color: #6b7280; white-space: nowrap; }}
        td.empty {{ color: #6b7280; font-style: italic; }}
        a {{ color: #2563eb; text-decoration: none; }}
        a:hover {{ text-decoration: underline; }}
    </style>
</head>
<body>
    <h1>Index of {title}</h1>
    <table>
        <tbody>{rows}
        </tbody>
    </table>
</body>
</html>
"##,
            title = escape_html(&title),
            rows = rows,
        )?;
        Ok(html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{read_body, test_router};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn entry(name: &str, is_dir: bool) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            href: name.to_string(),
            is_dir,
            size: None,
        }
    }

    fn resolved(relative: &str) -> ResolvedPath {
        ResolvedPath {
            absolute: PathBuf::from("/srv/data").join(relative),
            relative: relative.to_string(),
        }
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn directories_precede_files_and_keep_relative_order() {
        let children = vec![
            entry("b.txt", false),
            entry("zdir", true),
            entry("a.txt", false),
            entry("adir", true),
        ];
        let names: Vec<_> = listing_entries(&resolved(""), children)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["zdir", "adir", "b.txt", "a.txt"]);
    }

    #[test]
    fn parent_entry_only_below_root() {
        let root = listing_entries(&resolved(""), vec![entry("a", false)]);
        assert!(root.iter().all(|e| e.name != ".."));

        let child = listing_entries(&resolved("docs"), vec![entry("a", false)]);
        assert_eq!(child[0].name, "..");
        assert_eq!(child[0].href, "");

        let nested = listing_entries(&resolved("docs/2024"), vec![]);
        assert_eq!(nested[0].href, "docs");
    }

    #[test]
    fn names_are_escaped_and_links_encoded() {
        let page = PageData {
            path: "x".to_string(),
            items: vec![FileEntry {
                name: "<b>&.txt".to_string(),
                href: "x/<b>&.txt".to_string(),
                is_dir: false,
                size: Some(3),
            }],
        };
        let html = HtmlListing.render(&page).unwrap();
        assert!(html.contains("&lt;b&gt;&amp;.txt"));
        assert!(html.contains("/browse/x/%3Cb%3E%26.txt"));
        assert!(!html.contains("<b>&.txt"));
    }

    #[tokio::test]
    async fn browse_root_lists_entries_without_parent_link() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let app = test_router(dir.path(), |_| {});

        let res = get(app, "/browse/").await;
        assert_eq!(res.status(), StatusCode::OK);
        let html = String::from_utf8(read_body(res).await).unwrap();
        assert!(html.contains("a.txt"));
        assert!(html.contains("href=\"/browse/sub\""));
        assert!(!html.contains(">..<"));
        assert!(html.find("sub/").unwrap() < html.find("a.txt").unwrap());
    }

    #[tokio::test]
    async fn browse_subdirectory_has_parent_link() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        let app = test_router(dir.path(), |_| {});

        let res = get(app, "/browse/sub").await;
        assert_eq!(res.status(), StatusCode::OK);
        let html = String::from_utf8(read_body(res).await).unwrap();
        assert!(html.contains(">..<"));
        assert!(html.contains("href=\"/browse\""));
        assert!(html.contains("href=\"/browse/sub/inner\""));
    }

    #[tokio::test]
    async fn browse_file_downloads_it() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"raw bytes").unwrap();
        let app = test_router(dir.path(), |_| {});

        let res = get(app, "/browse/a.txt").await;
        assert_eq!(res.status(), StatusCode::OK);
        let disposition = res.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment"));
        assert_eq!(read_body(res).await, b"raw bytes");
    }

    #[tokio::test]
    async fn browse_missing_path_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = test_router(dir.path(), |_| {});
        let res = get(app, "/browse/ghost").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    struct FailingRenderer;

    impl PageRenderer for FailingRenderer {
        fn render(&self, _page: &PageData) -> Result<String, RenderError> {
            Err(RenderError::Format(std::fmt::Error))
        }
    }

    #[tokio::test]
    async fn render_failure_is_internal_error_not_partial_page() {
        let dir = TempDir::new().unwrap();
        let app = crate::server::test_support::test_router_with(
            dir.path(),
            Arc::new(FailingRenderer),
        );
        let res = get(app, "/browse").await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(read_body(res).await).unwrap();
        assert!(!body.contains("<html"));
        assert!(body.contains("failed to render directory page"));
    }
}
