//! HTML to readable text.
//!
//! A small tag-stripping pass: drops `<script>`/`<style>` bodies, turns
//! block-level closers into newlines, decodes the common entities and
//! collapses whitespace. Good enough to hand page content to a model.

/// Extract readable text from `html`, keeping at most `max_chars` characters.
pub fn html_to_text(html: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut out_chars = 0usize;
    let mut in_tag = false;
    let mut in_script = false;
    let mut in_style = false;
    let mut tag_buf = String::new();

    for ch in html.chars() {
        if out_chars >= max_chars {
            break;
        }

        match ch {
            '<' => {
                in_tag = true;
                tag_buf.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let tag_lower = tag_buf.to_lowercase();
                let name = tag_lower
                    .split(|c: char| c.is_whitespace() || c == '/' && !tag_lower.starts_with('/'))
                    .next()
                    .unwrap_or("");

                match name {
                    "script" => in_script = true,
                    "/script" => in_script = false,
                    "style" => in_style = true,
                    "/style" => in_style = false,
                    _ => {}
                }

                if is_block_break(name) && !out.ends_with('\n') {
                    out.push('\n');
                    out_chars += 1;
                }

                tag_buf.clear();
            }
            _ if in_tag => tag_buf.push(ch),
            _ if in_script || in_style => {}
            _ => {
                out.push(ch);
                out_chars += 1;
            }
        }
    }

    let out = decode_entities(&out);

    // Collapse runs of whitespace, keeping at most one blank line
    let mut result = String::new();
    let mut prev_blank = false;
    for line in out.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !prev_blank {
                result.push('\n');
                prev_blank = true;
            }
        } else {
            result.push_str(&collapsed);
            result.push('\n');
            prev_blank = false;
        }
    }

    result.trim().to_string()
}

fn is_block_break(name: &str) -> bool {
    matches!(
        name.trim_start_matches('/'),
        "p" | "div" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "li" | "tr" | "br" | "article"
            | "section" | "header" | "footer" | "blockquote" | "pre" | "table"
    ) && (name.starts_with('/') || name == "br")
}

fn decode_entities(s: &str) -> String {
    // `&amp;` last so "&amp;lt;" stays "&lt;"
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_scripts() {
        let html = "<html><body><h1>Hello</h1><p>World</p><script>var x=1;</script></body></html>";
        let text = html_to_text(html, 10_000);
        assert_eq!(text, "Hello\nWorld");
    }

    #[test]
    fn drops_style_blocks_with_attributes() {
        let html = r#"<style type="text/css">body { color: red }</style><div class="x">Body text</div>"#;
        assert_eq!(html_to_text(html, 10_000), "Body text");
    }

    #[test]
    fn decodes_entities() {
        let text = html_to_text("<p>A &amp; B &lt; C &amp;lt;</p>", 10_000);
        assert_eq!(text, "A & B < C &lt;");
    }

    #[test]
    fn line_breaks_from_br() {
        let text = html_to_text("one<br>two<br/>three", 10_000);
        assert_eq!(text, "one\ntwo\nthree");
    }

    #[test]
    fn respects_char_limit() {
        let html = "<p>This is a very long text that should be truncated</p>";
        let text = html_to_text(html, 10);
        assert!(text.chars().count() <= 10);
        assert!(text.starts_with("This is a"));
    }

    #[test]
    fn collapses_whitespace() {
        let text = html_to_text("<p>  lots   of\t space </p>\n\n\n<p>next</p>", 10_000);
        assert_eq!(text, "lots of space\n\nnext");
    }
}
