//! ES-module source normalization.
//!
//! Worker sources are ES modules whose default export is the handler object.
//! The engine executes classic scripts, so before compilation the module
//! syntax is rewritten to capture the default export into a well-known
//! global:
//!
//! ```javascript
//! // Before: export default { fetch(req) { ... } };
//! // After:  globalThis.__worker_module__ = { fetch(req) { ... } };
//! ```
//!
//! All patterns are line-anchored (`(?m)^`), so export-shaped text inside
//! string literals on continuation lines is never rewritten. Sources that
//! already assign `__worker_module__` pass through unchanged.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// The global slot the user module is captured into.
pub const MODULE_GLOBAL: &str = "__worker_module__";

static ALREADY_CAPTURED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:globalThis\.)?__worker_module__\s*=").unwrap()
});

// export default X;   /   export default { ... (multi-line)
static EXPORT_DEFAULT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s*)export\s+default\s+").unwrap());

// export { ... };  — named export lists. A `X as default` clause anywhere in
// the braces becomes the module capture; lists without one are dropped, since
// their declarations already exist.
static EXPORT_NAMED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s*)export\s*\{([^}]*)\}\s*;?\s*$").unwrap());

static AS_DEFAULT_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|,)\s*(\w+)\s+as\s+default\s*(?:,|$)").unwrap());

// export function f / export async function f / export class C /
// export const|let|var g
static EXPORT_INLINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(\s*)export\s+(async\s+function|function|class|const|let|var)\b").unwrap()
});

/// Rewrite an ES-module worker source into classic-script form.
pub fn transform_module(source: &str) -> String {
    if ALREADY_CAPTURED.is_match(source) {
        return source.to_string();
    }

    let mut result = source.to_string();

    result = EXPORT_NAMED
        .replace_all(&result, |caps: &Captures| {
            match AS_DEFAULT_CLAUSE.captures(&caps[2]) {
                Some(clause) => {
                    format!("{}globalThis.{} = {};", &caps[1], MODULE_GLOBAL, &clause[1])
                }
                None => String::new(),
            }
        })
        .to_string();

    result = EXPORT_DEFAULT
        .replace_all(&result, |caps: &Captures| {
            format!("{}globalThis.{} = ", &caps[1], MODULE_GLOBAL)
        })
        .to_string();

    result = EXPORT_INLINE
        .replace_all(&result, |caps: &Captures| {
            format!("{}{}", &caps[1], &caps[2])
        })
        .to_string();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_object_export() {
        let out = transform_module("export default { async fetch(req) { return 1; } };");
        assert_eq!(
            out,
            "globalThis.__worker_module__ = { async fetch(req) { return 1; } };"
        );
    }

    #[test]
    fn multi_line_default_export() {
        let src = "export default {\n  fetch(req, env) {\n    return new Response(\"ok\");\n  }\n};";
        let out = transform_module(src);
        assert!(out.starts_with("globalThis.__worker_module__ = {"));
        assert!(out.contains("fetch(req, env)"));
    }

    #[test]
    fn named_default_export() {
        let src = "const handler = { fetch() {} };\nexport { handler as default };";
        let out = transform_module(src);
        assert!(out.contains("globalThis.__worker_module__ = handler;"));
        assert!(!out.contains("export"));
    }

    #[test]
    fn named_default_with_siblings() {
        let src = "const h = {};\nconst a = 1;\nexport { h as default, a };";
        let out = transform_module(src);
        assert!(out.contains("globalThis.__worker_module__ = h;"));
    }

    #[test]
    fn named_default_after_siblings() {
        let src = "const h = {};\nconst a = 1;\nexport { a, h as default };";
        let out = transform_module(src);
        assert!(out.contains("globalThis.__worker_module__ = h;"));
        assert!(!out.contains("export"));
    }

    #[test]
    fn named_default_between_siblings() {
        let src = "const h = {};\nconst a = 1;\nconst b = 2;\nexport { a, h as default, b };";
        let out = transform_module(src);
        assert!(out.contains("globalThis.__worker_module__ = h;"));
    }

    #[test]
    fn plain_named_exports_are_dropped() {
        let src = "const a = 1;\nconst b = 2;\nexport { a, b };\n";
        let out = transform_module(src);
        assert!(out.contains("const a = 1;"));
        assert!(!out.contains("export"));
    }

    #[test]
    fn inline_exports_are_stripped() {
        let src = "export function helper() {}\nexport const limit = 3;\nexport class Widget {}\nexport async function go() {}\nexport let x = 1;\nexport var y = 2;";
        let out = transform_module(src);
        assert!(out.contains("function helper() {}"));
        assert!(out.contains("const limit = 3;"));
        assert!(out.contains("class Widget {}"));
        assert!(out.contains("async function go() {}"));
        assert!(!out.contains("export"));
    }

    #[test]
    fn captured_sources_pass_through() {
        let src = "globalThis.__worker_module__ = { fetch() {} };";
        assert_eq!(transform_module(src), src);
    }

    #[test]
    fn strings_on_their_own_lines_survive() {
        // Line-anchored patterns only touch statements that start a line.
        let src = "const s = \"not an \" +\n  \"export default thing\";\nexport default { fetch() { return s; } };";
        let out = transform_module(src);
        assert!(out.contains("\"export default thing\""));
        assert!(out.contains("globalThis.__worker_module__ = { fetch() { return s; } };"));
    }

    #[test]
    fn default_function_export() {
        let out = transform_module("export default function handler() {}");
        assert_eq!(out, "globalThis.__worker_module__ = function handler() {}");
    }
}
