// src/compare/text_diff.rs - Line comparison of auxiliary text files and HTML rendering
use std::fmt::Write as _;

/// Lines kept around each difference in the rendered table.
pub const CONTEXT_LINES: usize = 3;

/// Split on `\n`, `\r\n` or `\r`, so files written on different platforms compare equal.
pub fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        match rest.find(['\r', '\n']) {
            Some(pos) => {
                lines.push(&rest[..pos]);
                let skip = if rest[pos..].starts_with("\r\n") { 2 } else { 1 };
                rest = &rest[pos + skip..];
            }
            None => {
                lines.push(rest);
                break;
            }
        }
    }
    lines
}

/// Index of the first line that differs, comparing over the longer of the two
/// lists. A line present on one side only counts as a difference.
pub fn first_difference(a: &[&str], b: &[&str]) -> Option<usize> {
    (0..a.len().max(b.len())).find(|&i| a.get(i) != b.get(i))
}

/// Side-by-side HTML table of the differing lines plus [`CONTEXT_LINES`] of
/// context. Lines are paired by index.
pub fn render_html(a: &[&str], b: &[&str], name_a: &str, name_b: &str) -> String {
    let total = a.len().max(b.len());
    let changed: Vec<usize> = (0..total).filter(|&i| a.get(i) != b.get(i)).collect();

    let mut shown = vec![false; total];
    for &i in &changed {
        let start = i.saturating_sub(CONTEXT_LINES);
        let end = (i + CONTEXT_LINES + 1).min(total);
        shown[start..end].iter_mut().for_each(|s| *s = true);
    }

    let mut html = String::new();
    let _ = writeln!(html, "<!DOCTYPE html>");
    let _ = writeln!(html, "<html><head><meta charset=\"utf-8\"><title>{} vs {}</title>", escape(name_a), escape(name_b));
    let _ = writeln!(
        html,
        "<style>td{{font-family:monospace;white-space:pre}} .chg{{background:#ffe08a}} .gap{{color:#888}}</style>"
    );
    let _ = writeln!(html, "</head><body>");
    let _ = writeln!(html, "<p>{} differing lines</p>", changed.len());
    let _ = writeln!(html, "<table>");
    let _ = writeln!(html, "<tr><th></th><th>{}</th><th></th><th>{}</th></tr>", escape(name_a), escape(name_b));

    let mut next = 0;
    for i in (0..total).filter(|&i| shown[i]) {
        if i != next {
            gap_row(&mut html);
        }
        let class = if a.get(i) != b.get(i) { " class=\"chg\"" } else { "" };
        let _ = writeln!(
            html,
            "<tr{}>{}{}</tr>",
            class,
            cell(i, a.get(i).copied()),
            cell(i, b.get(i).copied())
        );
        next = i + 1;
    }
    if next < total {
        gap_row(&mut html);
    }

    let _ = writeln!(html, "</table>");
    let _ = writeln!(html, "</body></html>");
    html
}

fn gap_row(html: &mut String) {
    let _ = writeln!(html, "<tr class=\"gap\"><td colspan=\"4\">...</td></tr>");
}

fn cell(index: usize, line: Option<&str>) -> String {
    match line {
        Some(text) => format!("<td>{}</td><td>{}</td>", index + 1, escape(text)),
        None => "<td></td><td></td>".to_string(),
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
