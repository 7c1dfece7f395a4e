//! Server-generated HTML directory listing, per §4.8.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};

use crate::utils::format_size;

struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
    mtime: i64,
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `%d-%b-%Y %H:%M` formatting, per §4.8.
fn format_mtime(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.format("%d-%b-%Y %H:%M").to_string())
        .unwrap_or_default()
}

/// Render the HTML directory listing for `dir_path`, referenced at `request_path`.
pub fn render(dir_path: &Path, request_path: &str) -> std::io::Result<String> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        entries.push(Entry {
            name,
            is_dir: meta.is_dir(),
            size: meta.len(),
            mtime,
        });
    }

    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()))
    });

    let mut html = String::new();
    html.push_str("<html><head><title>Index</title></head><body><table>\n");

    if request_path != "/" {
        html.push_str("<tr><td><a href=\"../\">../</a></td><td></td><td></td></tr>\n");
    }

    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{request_path}/")
    };

    for entry in &entries {
        let href = if entry.is_dir {
            format!("{base}{}/", entry.name)
        } else {
            format!("{base}{}", entry.name)
        };
        let display = if entry.is_dir {
            format!("{}/", entry.name)
        } else {
            entry.name.clone()
        };
        let size = if entry.is_dir {
            "-".to_string()
        } else {
            format_size(entry.size)
        };
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>\n",
            html_escape(&href),
            html_escape(&display),
            size,
            format_mtime(entry.mtime)
        ));
    }

    html.push_str("</table></body></html>");
    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn lists_entries_dirs_first_then_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("b.txt")).unwrap();
        File::create(dir.path().join("A.txt")).unwrap();
        fs::create_dir(dir.path().join("z_dir")).unwrap();

        let html = render(dir.path(), "/d/").unwrap();
        let z_pos = html.find("z_dir/").unwrap();
        let a_pos = html.find("A.txt").unwrap();
        let b_pos = html.find("b.txt").unwrap();
        assert!(z_pos < a_pos);
        assert!(a_pos < b_pos);
    }

    #[test]
    fn parent_link_omitted_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let html = render(dir.path(), "/").unwrap();
        assert!(!html.contains("../"));
    }

    #[test]
    fn parent_link_present_below_root() {
        let dir = tempfile::tempdir().unwrap();
        let html = render(dir.path(), "/d/").unwrap();
        assert!(html.contains("../"));
    }

    #[test]
    fn entry_links_are_absolute_under_request_path() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("a.txt")).unwrap();
        File::create(dir.path().join("b.txt")).unwrap();
        let html = render(dir.path(), "/d/").unwrap();
        assert!(html.contains(r#"<a href="/d/a.txt">a.txt</a>"#));
        assert!(html.contains(r#"<a href="/d/b.txt">b.txt</a>"#));
    }

    #[test]
    fn hidden_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join(".hidden")).unwrap();
        let mut visible = File::create(dir.path().join("visible.txt")).unwrap();
        writeln!(visible, "hi").unwrap();
        let html = render(dir.path(), "/d/").unwrap();
        assert!(!html.contains(".hidden"));
        assert!(html.contains("visible.txt"));
    }

    #[test]
    fn mtime_formatting_is_stable() {
        // 2024-01-15 12:34:00 UTC
        assert_eq!(format_mtime(1705322040), "15-Jan-2024 12:34");
    }
}
