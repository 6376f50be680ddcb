//! HTML document shell around rendered page fragments

use std::collections::BTreeMap;

/// Id of the script tag carrying serialized props
pub const PROPS_SCRIPT_ID: &str = "__SILCROW_PROPS__";

/// Inputs for [`wrap_document`]
#[derive(Debug, Clone, Copy)]
pub struct DocumentParts<'a> {
    pub locale: Option<&'a str>,
    /// `name` → `content` pairs rendered as `<meta>` tags; `title` becomes `<title>`
    pub meta: &'a BTreeMap<String, String>,
    pub props: Option<&'a serde_json::Value>,
}

/// Wrap `body` in a complete HTML document.
///
/// Props are embedded as a JSON script payload for client rehydration. A
/// `<` inside the JSON is escaped so the payload can't close the script tag.
pub fn wrap_document(body: &str, parts: &DocumentParts<'_>) -> String {
    let mut html = String::with_capacity(body.len() + 256);

    html.push_str("<!DOCTYPE html>\n");
    html.push_str(&format!(
        "<html lang=\"{}\">\n<head>\n<meta charset=\"utf-8\">\n",
        escape_attr(parts.locale.unwrap_or("en"))
    ));
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");

    for (name, content) in parts.meta {
        if name == "title" {
            html.push_str(&format!("<title>{}</title>\n", escape_text(content)));
        } else {
            html.push_str(&format!(
                "<meta name=\"{}\" content=\"{}\">\n",
                escape_attr(name),
                escape_attr(content)
            ));
        }
    }

    html.push_str("</head>\n<body>\n");
    html.push_str(body);
    html.push('\n');

    if let Some(props) = parts.props {
        let json = props.to_string().replace('<', "\\u003c");
        html.push_str(&format!(
            "<script id=\"{}\" type=\"application/json\">{}</script>\n",
            PROPS_SCRIPT_ID, json
        ));
    }

    html.push_str("</body>\n</html>\n");
    html
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meta_and_title() {
        let meta = BTreeMap::from([
            ("title".to_string(), "Posts & News".to_string()),
            ("description".to_string(), "say \"hi\"".to_string()),
        ]);
        let html = wrap_document(
            "<main>x</main>",
            &DocumentParts {
                locale: Some("fr"),
                meta: &meta,
                props: None,
            },
        );

        assert!(html.contains("<html lang=\"fr\">"));
        assert!(html.contains("<title>Posts &amp; News</title>"));
        assert!(html.contains("content=\"say &quot;hi&quot;\""));
        assert!(html.contains("<main>x</main>"));
        assert!(!html.contains(PROPS_SCRIPT_ID));
    }

    #[test]
    fn test_props_payload_cannot_close_script() {
        let meta = BTreeMap::new();
        let props = json!({ "bio": "</script><script>alert(1)</script>" });
        let html = wrap_document(
            "",
            &DocumentParts {
                locale: None,
                meta: &meta,
                props: Some(&props),
            },
        );

        assert_eq!(html.matches("</script>").count(), 1);
        assert!(html.contains("\\u003c/script>"));
    }
}
