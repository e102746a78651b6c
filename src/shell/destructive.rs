// ABOUTME: Destructive-command detection over lexed shell segments.
// ABOUTME: Skips no-op wrappers, matches flag clusters in any order, re-inspects nested shell scripts.

use std::collections::HashSet;
use std::path::Path;

use super::lexer::{self, BashNode, ComplexReason};

/// Patterns flagged regardless of policy configuration.
pub const BUILTIN_DESTRUCTIVE: &[&str] = &[
    "rm -rf",
    "git push --force",
    "git push -f",
    "git reset --hard",
    "git clean -f",
    "mkfs",
    "dd of=",
    "shred",
    "chmod -R 777",
];

/// Nested `sh -c` / `eval` scripts inspected before giving up.
const MAX_NESTING: usize = 4;

/// A wrapper that runs the command after its own options.
struct Wrapper {
    name: &'static str,
    /// Options that consume the following word.
    takes_value: &'static [&'static str],
    /// Leading positional words consumed before the wrapped command.
    positionals: usize,
}

const WRAPPERS: &[Wrapper] = &[
    Wrapper { name: "env", takes_value: &["-u", "--unset", "-C", "--chdir"], positionals: 0 },
    Wrapper { name: "nice", takes_value: &["-n", "--adjustment"], positionals: 0 },
    Wrapper { name: "ionice", takes_value: &["-c", "-n", "-p", "--class", "--classdata"], positionals: 0 },
    Wrapper { name: "nohup", takes_value: &[], positionals: 0 },
    Wrapper { name: "time", takes_value: &["-f", "-o", "--format", "--output"], positionals: 0 },
    Wrapper { name: "command", takes_value: &[], positionals: 0 },
    Wrapper { name: "exec", takes_value: &["-a"], positionals: 0 },
    Wrapper { name: "sudo", takes_value: &["-u", "-g", "-C", "-h", "-p", "-U"], positionals: 0 },
    Wrapper { name: "timeout", takes_value: &["-s", "--signal", "-k", "--kill-after"], positionals: 1 },
    Wrapper { name: "stdbuf", takes_value: &["-i", "-o", "-e"], positionals: 0 },
    Wrapper { name: "xargs", takes_value: &["-n", "-I", "-P", "-L", "-d", "-s", "-a", "-E"], positionals: 0 },
];

const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];

/// GNU long options and the short flags they stand for.
const LONG_FLAGS: &[(&str, &str)] = &[("recursive", "rR"), ("force", "f")];

/// One parsed entry of the destructive table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestructivePattern {
    raw: String,
    command: String,
    requirements: Vec<String>,
}

impl DestructivePattern {
    /// Parse a whitespace-separated pattern. Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut words = raw.split_whitespace();
        let command = words.next()?.to_string();
        Some(Self {
            raw: words_joined(raw),
            command,
            requirements: words.map(str::to_string).collect(),
        })
    }

    /// The pattern text with whitespace collapsed.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match against an unquoted command word and its arguments.
    pub fn matches(&self, command: &str, args: &[String]) -> bool {
        let base = basename(command);
        let command_matches = base == self.command
            || base
                .strip_prefix(self.command.as_str())
                .is_some_and(|rest| rest.starts_with('.'));
        if !command_matches {
            return false;
        }

        let mut short_flags: HashSet<char> = HashSet::new();
        for arg in args {
            if let Some(long) = arg.strip_prefix("--") {
                let name = long.split('=').next().unwrap_or(long);
                if let Some((_, letters)) = LONG_FLAGS.iter().find(|(n, _)| *n == name) {
                    short_flags.extend(letters.chars());
                }
            } else if let Some(cluster) = arg.strip_prefix('-') {
                short_flags.extend(cluster.chars());
            }
        }

        self.requirements.iter().all(|req| {
            if let Some(letters) = req.strip_prefix('-').filter(|l| !l.starts_with('-')) {
                !letters.is_empty() && letters.chars().all(|c| short_flags.contains(&c))
            } else if req.ends_with('=') {
                args.iter().any(|a| a.starts_with(req.as_str()))
            } else {
                args.iter().any(|a| a == req)
            }
        })
    }

    /// Match used for text that could not be parsed.
    ///
    /// The text is cut at shell punctuation and every word of every piece is
    /// tried as a command word with the rest of its piece as arguments. Quotes
    /// are dropped, so this errs towards flagging.
    fn matches_raw(&self, raw: &str) -> bool {
        raw.split(|c: char| matches!(c, ';' | '&' | '|' | '(' | ')' | '`' | '{' | '}' | '\n'))
            .map(|piece| {
                piece
                    .split_whitespace()
                    .map(|w| w.trim_matches(|c: char| matches!(c, '"' | '\'' | '$' | '\\')))
                    .filter(|w| !w.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<String>>()
            })
            .any(|words| (0..words.len()).any(|i| self.matches(&words[i], &words[i + 1..])))
    }
}

/// A destructive finding with the segment that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestructiveMatch {
    pub pattern: String,
    pub segment: String,
    /// Set when the match came from the raw-text fallback.
    pub complex: Option<ComplexReason>,
}

/// Matcher built from the built-in table plus configured patterns.
#[derive(Debug, Clone)]
pub struct DestructiveMatcher {
    patterns: Vec<DestructivePattern>,
}

impl Default for DestructiveMatcher {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl DestructiveMatcher {
    /// Build a matcher with the built-in patterns and `extra` ones.
    pub fn new(extra: &[String]) -> Self {
        let mut patterns: Vec<DestructivePattern> = Vec::new();
        let sources = BUILTIN_DESTRUCTIVE
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str));
        for source in sources {
            if let Some(p) = DestructivePattern::parse(source) {
                if !patterns.contains(&p) {
                    patterns.push(p);
                }
            }
        }
        Self { patterns }
    }

    pub fn patterns(&self) -> &[DestructivePattern] {
        &self.patterns
    }

    /// First destructive construct found in `command`, if any.
    pub fn find(&self, command: &str) -> Option<DestructiveMatch> {
        self.find_nested(command, 0)
    }

    pub fn is_destructive(&self, command: &str) -> bool {
        self.find(command).is_some()
    }

    fn find_nested(&self, command: &str, depth: usize) -> Option<DestructiveMatch> {
        for node in lexer::parse(command) {
            match node {
                BashNode::Complex { reason, raw } => {
                    if let Some(p) = self.patterns.iter().find(|p| p.matches_raw(&raw)) {
                        return Some(DestructiveMatch {
                            pattern: p.raw.clone(),
                            segment: raw,
                            complex: Some(reason),
                        });
                    }
                }
                BashNode::Group { body, raw } => {
                    if let Some(found) = self.recurse(&body, &raw, depth) {
                        return Some(found);
                    }
                }
                BashNode::Command { command: cmd, args, tokens } => {
                    let segment = tokens.join(" ");
                    let mut words = Vec::with_capacity(args.len() + 1);
                    words.push(cmd);
                    // Redirection operators and their targets are not arguments.
                    let mut skip_target = false;
                    for (arg, raw) in args.into_iter().zip(tokens.iter().skip(1)) {
                        if skip_target {
                            skip_target = false;
                        } else if lexer::is_redirection(raw) {
                            skip_target = true;
                        } else {
                            words.push(arg);
                        }
                    }
                    if let Some(found) = self.check_words(&words, &segment, depth) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    fn check_words(&self, words: &[String], segment: &str, depth: usize) -> Option<DestructiveMatch> {
        let (invoked, nested) = unwrap_command(words);
        if let Some(script) = nested {
            if let Some(found) = self.recurse(&script, segment, depth) {
                return Some(found);
            }
        }
        let (command, args) = invoked.split_first()?;

        if let Some(p) = self.patterns.iter().find(|p| p.matches(command, args)) {
            return Some(DestructiveMatch {
                pattern: p.raw.clone(),
                segment: segment.to_string(),
                complex: None,
            });
        }

        let base = basename(command);
        let script = if SHELLS.contains(&base) {
            args.iter()
                .position(|a| a == "-c" || (a.starts_with('-') && !a.starts_with("--") && a.ends_with('c')))
                .and_then(|i| args.get(i + 1))
                .cloned()
        } else if base == "eval" {
            Some(args.join(" "))
        } else {
            None
        };
        script.and_then(|s| self.recurse(&s, segment, depth))
    }

    fn recurse(&self, script: &str, segment: &str, depth: usize) -> Option<DestructiveMatch> {
        if depth >= MAX_NESTING {
            // Too deep to follow: fall back to raw matching on the script text.
            return self.patterns.iter().find(|p| p.matches_raw(script)).map(|p| {
                DestructiveMatch {
                    pattern: p.raw.clone(),
                    segment: segment.to_string(),
                    complex: None,
                }
            });
        }
        self.find_nested(script, depth + 1).map(|mut found| {
            found.segment = segment.to_string();
            found
        })
    }
}

/// Strip leading assignments, reserved words, and wrapper commands.
///
/// Returns the words of the actually invoked command plus any script carried
/// by `env -S`, which must be inspected separately.
fn unwrap_command(words: &[String]) -> (&[String], Option<String>) {
    let mut rest = words;
    let mut nested = None;
    loop {
        while rest.first().is_some_and(|w| is_assignment(w) || is_reserved(w)) {
            rest = &rest[1..];
        }
        let Some(first) = rest.first() else {
            return (rest, nested);
        };
        let Some(wrapper) = WRAPPERS.iter().find(|w| w.name == basename(first)) else {
            return (rest, nested);
        };

        let mut i = 1;
        while let Some(word) = rest.get(i) {
            if word == "--" {
                i += 1;
                break;
            }
            if wrapper.name == "env" && (word == "-S" || word == "--split-string") {
                nested = rest.get(i + 1).cloned();
                i += 2;
                continue;
            }
            if !word.starts_with('-') || word == "-" {
                if wrapper.name == "env" && word == "-" {
                    i += 1;
                    continue;
                }
                break;
            }
            let flag = word.split('=').next().unwrap_or(word);
            if wrapper.takes_value.contains(&flag) && !word.contains('=') {
                i += 2;
            } else {
                i += 1;
            }
        }
        // `nice -5 cmd` style numeric flags were consumed above as plain flags.
        i += wrapper.positionals;
        if wrapper.name == "env" {
            while rest.get(i).is_some_and(|w| is_assignment(w)) {
                i += 1;
            }
        }
        rest = rest.get(i..).unwrap_or(&[]);
    }
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Keywords and group openers that run the next word, plus `name()`
/// function headers.
fn is_reserved(word: &str) -> bool {
    lexer::KEYWORDS.contains(&word) || word == "{" || word == "(" || word.ends_with("()")
}

fn basename(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command)
}

fn words_joined(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flagged(command: &str) -> bool {
        DestructiveMatcher::default().is_destructive(command)
    }

    #[test]
    fn flags_rm_rf_standalone_and_chained() {
        assert!(flagged("rm -rf /"));
        assert!(flagged("ls && rm -rf /"));
        assert!(flagged("false || rm -rf /"));
        assert!(flagged("cd /tmp; rm -rf /"));
        assert!(flagged("ls | rm -rf /"));
    }

    #[test]
    fn flag_clusters_match_in_any_order() {
        assert!(flagged("rm -fr build"));
        assert!(flagged("rm -r -f build"));
        assert!(flagged("rm -rfv build"));
        assert!(!flagged("rm -r build"));
        assert!(!flagged("rm file.txt"));
    }

    #[test]
    fn wrappers_are_skipped() {
        assert!(flagged("env -i rm -rf /"));
        assert!(flagged("env FOO=bar rm -rf /"));
        assert!(flagged("nice -n 10 rm -rf /"));
        assert!(flagged("FOO=1 nohup rm -rf /"));
        assert!(flagged("sudo -u root rm -rf /"));
        assert!(flagged("timeout 5 rm -rf /"));
        assert!(flagged("/bin/rm -rf /"));
        assert!(flagged("find . -name x | xargs rm -rf"));
    }

    #[test]
    fn quoted_text_is_not_a_command() {
        assert!(!flagged(r#"echo "rm -rf /""#));
        assert!(!flagged("echo 'git reset --hard'"));
        assert!(!flagged(r#"git commit -m "rm -rf old code""#));
    }

    #[test]
    fn substitutions_fall_back_to_raw_matching() {
        let found = DestructiveMatcher::default().find("echo $(rm -rf /)").unwrap();
        assert_eq!(found.complex, Some(ComplexReason::CommandSubstitution));
        assert!(flagged("echo `rm -rf /`"));
        assert!(!flagged("echo $(date)"));
    }

    #[test]
    fn nested_shell_scripts_are_inspected() {
        assert!(flagged(r#"bash -c "rm -rf /""#));
        assert!(flagged(r#"sh -lc 'git push --force origin main'"#));
        assert!(flagged("eval rm -rf /"));
        assert!(flagged(r#"env -S "rm -rf /""#));
        assert!(!flagged(r#"bash -c "ls -la""#));
    }

    #[test]
    fn groups_and_keywords_do_not_hide_commands() {
        assert!(flagged("echo { ; rm -rf /"));
        assert!(flagged("echo a{ && rm -rf /"));
        assert!(flagged("(rm -rf /)"));
        assert!(flagged("{ rm -rf /; }"));
        assert!(flagged("(cd /tmp && (rm -rf /))"));
        assert!(flagged("if true; then rm -rf /; fi"));
        assert!(flagged("if rm -rf /; then :; fi"));
        assert!(flagged("for f in x; do rm -rf /; done"));
        assert!(flagged("while true; do { rm -rf /; }; done"));
        assert!(flagged("! rm -rf /"));
        assert!(flagged("time -p rm -rf /"));
        assert!(flagged("wipe() { rm -rf /; }; wipe"));
        assert!(!flagged("(cd build && make)"));
        assert!(!flagged("if true; then echo done; fi"));
    }

    #[test]
    fn long_options_count_as_their_short_flags() {
        assert!(flagged("rm --recursive --force /"));
        assert!(flagged("rm --force -r /"));
        assert!(flagged("chmod --recursive 777 /srv"));
        assert!(flagged("git clean --force -d"));
        assert!(!flagged("rm --force file.txt"));
    }

    #[test]
    fn raw_fallback_matches_reordered_flags() {
        assert!(flagged("echo $(rm -fr /)"));
        assert!(flagged("echo $(rm -r -f /)"));
        assert!(flagged("echo \"$(rm --recursive --force /)\""));
        assert!(flagged("x=`git push -f origin`"));
        assert!(!flagged("echo $(rm -r build)"));
    }

    #[test]
    fn git_and_device_patterns() {
        assert!(flagged("git push --force origin main"));
        assert!(flagged("git push -f"));
        assert!(flagged("git reset --hard HEAD~1"));
        assert!(!flagged("git push origin main"));
        assert!(flagged("mkfs.ext4 /dev/sda1"));
        assert!(flagged("dd if=/dev/zero of=/dev/sda"));
    }

    #[test]
    fn configured_patterns_extend_builtin() {
        let matcher = DestructiveMatcher::new(&["kubectl delete".to_string()]);
        assert!(matcher.is_destructive("kubectl delete pod x"));
        assert!(matcher.is_destructive("rm -rf /"));
        assert!(!DestructiveMatcher::default().is_destructive("kubectl delete pod x"));
    }

    #[test]
    fn redirection_targets_are_not_arguments() {
        let matcher = DestructiveMatcher::new(&["truncate /".to_string()]);
        assert!(!matcher.is_destructive("truncate -s 0 file > /"));
    }
}
