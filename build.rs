use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own sources. Reference material and build
// output elsewhere in the tree is never scanned.
const SOURCE_DIRS: [&str; 9] = [
    "survey", "shared", "impute", "reduce", "analyze", "cli", "tests", "benches", "build.rs",
];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::UppercaseComment => r"(//|/\*|///).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn applies_to_build_script(self) -> bool {
        self == Rule::UnderscorePrefix
    }

    fn headline(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed variables",
            Rule::ForbiddenWord | Rule::StarsInComment => "forbidden comment patterns",
            Rule::UppercaseComment => "comments with all uppercase alphabetic characters",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Rule::UnderscorePrefix => "Underscore-prefixed variable names are not allowed in this project.\n   \
                 Either use the variable (removing the underscore) or remove it completely."
                .to_string(),
            Rule::ForbiddenWord | Rule::StarsInComment => format!(
                "Comments containing {} are STRICTLY FORBIDDEN in this project.\n   \
                 The '**' pattern is not allowed in regular comments (but is allowed in doc comments).\n   \
                 Remove these patterns rather than commenting them out.",
                FORBIDDEN_WORDS.map(|w| format!("'{w}'")).join(", ")
            ),
            Rule::UppercaseComment => {
                "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN in this project.\n   \
                 STRONGLY CONSIDER deleting the comment completely."
                    .to_string()
            }
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.\n   \
                 Either use the code (removing the attribute) or remove it completely."
                .to_string(),
        }
    }

    /// Whether a matched line really violates the rule.
    fn violated_by(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscorePrefix => {
                let is_pure_comment = trimmed.starts_with("//")
                    || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"));
                // Odd segments of a quote split lie inside string literals.
                let is_in_string = line
                    .split('"')
                    .enumerate()
                    .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !is_pure_comment && !is_in_string
            }
            Rule::ForbiddenWord => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::UppercaseComment => {
                let comment = if let Some(rest) = trimmed.strip_prefix("///") {
                    rest.trim()
                } else if let Some(rest) = trimmed.strip_prefix("//") {
                    rest.trim()
                } else if let Some(idx) = line.find("/*") {
                    let rest = &line[idx + 2..];
                    rest.find("*/").map_or(rest, |end| &rest[..end]).trim()
                } else {
                    return false;
                };
                let mut letters = comment.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }
            Rule::AllowDeadCode => true,
        }
    }
}

// Collects every violating line of one file.
struct LineCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl LineCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.headline(),
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.advice()));
        Some(message)
    }
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.violated_by(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

/// Every `.rs` file under the crate's source directories.
fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .collect()
}

fn scan(rule: Rule, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in sources {
        if path.file_name().is_some_and(|name| name == "build.rs") && !rule.applies_to_build_script() {
            continue;
        }
        let mut collector = LineCollector::new(rule, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(message) = collector.error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    manually_check_for_unused_variables();

    let sources = rust_sources();
    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule, &sources) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

// Compiles this script alone with the project's deny lints.
fn manually_check_for_unused_variables() {
    let status = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "build.rs",
        ])
        .output();

    match status {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let problem = if stderr.contains("unused variable") {
                Some("Unused variables")
            } else if stderr.contains("never used") {
                Some("Unused functions")
            } else if stderr.contains("unused import") {
                Some("Unused imports")
            } else {
                None
            };
            if let Some(problem) = problem {
                eprintln!("\n❌ ERROR: {problem} detected in build.rs!");
                eprintln!("{stderr}");
                eprintln!("\n⚠️ {problem} are STRICTLY FORBIDDEN in this project.");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => {
            println!("cargo:warning=Could not check for unused variables/functions/imports in build.rs");
        }
    }
}
