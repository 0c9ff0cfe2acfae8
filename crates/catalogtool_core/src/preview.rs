use serde::Serialize;
use similar::TextDiff;

/// Unified diff of one content field, shown for dry runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldPreview {
    pub file: String,
    pub handle: Option<String>,
    pub field: String,
    pub diff: String,
}

impl FieldPreview {
    pub fn new(file: &str, handle: Option<&str>, field: &str, before: &str, after: &str) -> Self {
        let label = handle.unwrap_or("<no handle>");
        Self {
            file: file.to_string(),
            handle: handle.map(ToString::to_string),
            field: field.to_string(),
            diff: render_field_diff(&format!("{file}:{label}:{field}"), before, after),
        }
    }
}

/// Catalog HTML is usually a single line; break after each tag so the diff
/// points at the changed element instead of the whole field.
pub fn render_field_diff(label: &str, before: &str, after: &str) -> String {
    let before = split_tags(before);
    let after = split_tags(after);
    TextDiff::from_lines(&before, &after)
        .unified_diff()
        .context_radius(1)
        .header(&format!("a/{label}"), &format!("b/{label}"))
        .to_string()
}

fn split_tags(html: &str) -> String {
    let mut out = html.replace('>', ">\n");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_isolates_the_changed_tag() {
        let before = r#"<p>Intro</p><a href="/collections/vapetasia">Vapetasia</a><p>Outro</p>"#;
        let after = r#"<p>Intro</p><a href="/collections/usa-premium-e-juices">Vapetasia</a><p>Outro</p>"#;
        let preview = FieldPreview::new("products.json", Some("ghost-pod"), "body_html", before, after);

        assert!(preview.diff.contains("--- a/products.json:ghost-pod:body_html"));
        assert!(preview.diff.contains(r#"-<a href="/collections/vapetasia">"#));
        assert!(preview.diff.contains(r#"+<a href="/collections/usa-premium-e-juices">"#));
        assert!(!preview.diff.contains("-Intro</p>"));
    }

    #[test]
    fn identical_fields_render_no_hunks() {
        let diff = render_field_diff("x", "<p>same</p>", "<p>same</p>");
        assert!(!diff.contains("@@"));
    }
}
