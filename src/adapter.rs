use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::config::AdapterKind;
use crate::record::RawRecord;

static TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<table[^>]*>(.*?)</table>").unwrap());
static ROW_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?si)<tr[^>]*>(.*?)</tr>").unwrap());
static HEADER_CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<th[^>]*>(.*?)</th>").unwrap());
static DATA_CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<td[^>]*>(.*?)</td>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static FEED_SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?si)<script[^>]*type="application/json"[^>]*>(.*?)</script>"#).unwrap()
});
static FEED_ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)window\.__POSITIONS__\s*=\s*(\[.*?\])\s*;").unwrap()
});

/// A page after the browser finished rendering it.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
}

/// Per-site extraction capability. Total over any well-formed page:
/// malformed content yields an empty vec, never an error.
pub trait ExtractionAdapter: Send + Sync {
    fn extract(&self, page: &RenderedPage) -> Vec<RawRecord>;
}

pub fn for_kind(kind: AdapterKind) -> &'static dyn ExtractionAdapter {
    match kind {
        AdapterKind::PositionGrid => &PositionGridAdapter,
        AdapterKind::JsonFeed => &JsonFeedAdapter,
    }
}

/// Extracts position rows from an HTML table. Column names come from the
/// header row (`<th>` text, lowercased, spaces → underscores); each data row
/// maps column → cell text. Rows with no `<td>` cells are skipped.
pub struct PositionGridAdapter;

impl ExtractionAdapter for PositionGridAdapter {
    fn extract(&self, page: &RenderedPage) -> Vec<RawRecord> {
        let Some(table) = TABLE_RE.captures(&page.html).map(|c| c[1].to_string()) else {
            return Vec::new();
        };

        let mut columns: Vec<String> = Vec::new();
        let mut records = Vec::new();

        for row in ROW_RE.captures_iter(&table) {
            let row_html = &row[1];

            if columns.is_empty() {
                let headers: Vec<String> = HEADER_CELL_RE
                    .captures_iter(row_html)
                    .map(|c| column_name(&c[1]))
                    .collect();
                if !headers.is_empty() {
                    columns = headers;
                    continue;
                }
            }

            let cells: Vec<String> = DATA_CELL_RE
                .captures_iter(row_html)
                .map(|c| cell_text(&c[1]))
                .collect();
            if cells.is_empty() || columns.is_empty() {
                continue;
            }

            let record: RawRecord = columns
                .iter()
                .zip(cells)
                .map(|(col, cell)| (col.clone(), Value::String(cell)))
                .collect();
            if !record.is_empty() {
                records.push(record);
            }
        }

        records
    }
}

/// Extracts positions from a JSON array embedded in the page, either in a
/// `<script type="application/json">` block or a `window.__POSITIONS__`
/// assignment. Non-object array entries are skipped.
pub struct JsonFeedAdapter;

impl ExtractionAdapter for JsonFeedAdapter {
    fn extract(&self, page: &RenderedPage) -> Vec<RawRecord> {
        let payload = FEED_SCRIPT_RE
            .captures(&page.html)
            .or_else(|| FEED_ASSIGN_RE.captures(&page.html))
            .map(|c| c[1].to_string());

        let Some(payload) = payload else {
            return Vec::new();
        };
        let Ok(value) = serde_json::from_str::<Value>(payload.trim()) else {
            return Vec::new();
        };

        match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map.into_iter().collect()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn column_name(raw: &str) -> String {
    cell_text(raw).to_lowercase().replace([' ', '-'], "_")
}

fn cell_text(raw: &str) -> String {
    TAG_RE.replace_all(raw, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(html: &str) -> RenderedPage {
        RenderedPage {
            url: "https://tracker.example/fleet".into(),
            html: html.into(),
        }
    }

    const GRID: &str = r#"
        <html><body>
        <table class="positions">
          <tr><th>Name</th><th>MMSI</th><th>Speed</th></tr>
          <tr><td><a href="/v/1">Fortuna</a></td><td>227941000</td><td>11.2</td></tr>
          <tr><td>Aldebaran</td><td>227635210</td><td>0.1</td></tr>
        </table>
        </body></html>"#;

    #[test]
    fn grid_extracts_rows() {
        let records = PositionGridAdapter.extract(&page(GRID));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], Value::String("Fortuna".into()));
        assert_eq!(records[0]["mmsi"], Value::String("227941000".into()));
        assert_eq!(records[1]["speed"], Value::String("0.1".into()));
    }

    #[test]
    fn grid_without_table_is_empty() {
        assert!(PositionGridAdapter.extract(&page("<html><body>nothing</body></html>")).is_empty());
    }

    #[test]
    fn grid_without_header_is_empty() {
        let html = "<table><tr><td>Fortuna</td></tr></table>";
        assert!(PositionGridAdapter.extract(&page(html)).is_empty());
    }

    #[test]
    fn grid_never_panics_on_malformed_html() {
        let html = "<table><tr><th>Name</th><tr><td>unclosed";
        let _ = PositionGridAdapter.extract(&page(html));
    }

    #[test]
    fn json_feed_from_script_tag() {
        let html = r#"<script type="application/json">
            [{"mmsi": "227941000", "lat": 47.2, "lon": -2.9}]
        </script>"#;
        let records = JsonFeedAdapter.extract(&page(html));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["mmsi"], Value::String("227941000".into()));
    }

    #[test]
    fn json_feed_from_window_assignment() {
        let html = r#"<script>window.__POSITIONS__ = [{"mmsi": "1"}, {"mmsi": "2"}];</script>"#;
        let records = JsonFeedAdapter.extract(&page(html));
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn json_feed_skips_non_objects() {
        let html = r#"<script>window.__POSITIONS__ = [{"mmsi": "1"}, 42, "x"];</script>"#;
        assert_eq!(JsonFeedAdapter.extract(&page(html)).len(), 1);
    }

    #[test]
    fn json_feed_invalid_json_is_empty() {
        let html = r#"<script type="application/json">{not json</script>"#;
        assert!(JsonFeedAdapter.extract(&page(html)).is_empty());
    }
}
