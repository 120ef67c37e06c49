//! Builtin commands for the fallback interpreter.
//!
//! Each builtin is a pure function of its arguments, piped stdin text and
//! the shell identity config, except `sleep` (async) and `date` (clock).
//! Exit codes follow shell convention: 0 success, 1 failure.

use chrono::{Local, Utc};

use super::StageResult;
use crate::config::ShellConfig;

const BUILTINS: &[&str] = &[
    "echo", "date", "whoami", "hostname", "pwd", "env", "which", "type", "seq",
    "sleep", "true", "false", "head", "tail", "wc", "sort", "uniq", "tr", "rev",
];

const SEQ_MAX_LINES: i64 = 100_000;

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub async fn run_builtin(
    name: &str,
    args: &[String],
    stdin: &str,
    config: &ShellConfig,
) -> StageResult {
    match name {
        "echo" => echo(args),
        "date" => date(args),
        "whoami" => StageResult::ok(format!("{}\n", config.user)),
        "hostname" => StageResult::ok(format!("{}\n", config.hostname)),
        "pwd" => StageResult::ok("/\n".to_string()),
        "env" => env(config),
        "which" => which(args, config),
        "type" => type_cmd(args, config),
        "seq" => seq(args),
        "sleep" => sleep(args).await,
        "true" => StageResult::exit(0),
        "false" => StageResult::exit(1),
        "head" => head_tail(args, stdin, false),
        "tail" => head_tail(args, stdin, true),
        "wc" => wc(args, stdin),
        "sort" => sort(args, stdin),
        "uniq" => uniq(args, stdin),
        "tr" => tr(args, stdin),
        "rev" => rev(stdin),
        _ => StageResult::fail(format!("{name}: not a builtin\n")),
    }
}

fn echo(args: &[String]) -> StageResult {
    let mut newline = true;
    let mut escapes = false;
    let mut rest = args;
    while let Some(first) = rest.first() {
        match first.as_str() {
            "-n" => newline = false,
            "-e" => escapes = true,
            _ => break,
        }
        rest = &rest[1..];
    }

    let mut text = rest.join(" ");
    if escapes {
        text = unescape(&text);
    }
    if newline {
        text.push('\n');
    }
    StageResult::ok(text)
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn date(args: &[String]) -> StageResult {
    let text = if args.iter().any(|a| a == "-u") {
        Utc::now().format("%a %b %e %H:%M:%S UTC %Y").to_string()
    } else {
        Local::now().format("%a %b %e %H:%M:%S %Z %Y").to_string()
    };
    StageResult::ok(format!("{text}\n"))
}

fn env(config: &ShellConfig) -> StageResult {
    StageResult::ok(format!(
        "USER={}\nHOSTNAME={}\nHOME=/home/{}\nPATH=/usr/local/bin:/usr/bin:/bin\nSHELL=/bin/sh\nPWD=/\n",
        config.user, config.hostname, config.user
    ))
}

fn which(args: &[String], config: &ShellConfig) -> StageResult {
    if args.is_empty() {
        // Bare `which` lists everything runnable here.
        let mut out = BUILTINS.join("\n");
        out.push('\n');
        return StageResult::ok(out);
    }
    let mut stdout = String::new();
    let mut missing = false;
    for name in args {
        if is_builtin(name) {
            stdout.push_str(&format!("{name}: builtin command\n"));
        } else if let Some(pkg) = config.package_aliases.get(name.as_str()) {
            stdout.push_str(&format!("{name}: package {pkg}\n"));
        } else {
            missing = true;
        }
    }
    if missing {
        StageResult {
            stdout,
            stderr: format!("which: no {} in builtins\n", args.join(" ")),
            exit_code: 1,
        }
    } else {
        StageResult::ok(stdout)
    }
}

fn type_cmd(args: &[String], config: &ShellConfig) -> StageResult {
    let mut stdout = String::new();
    let mut missing = false;
    for name in args {
        if is_builtin(name) {
            stdout.push_str(&format!("{name} is a shell builtin\n"));
        } else if let Some(pkg) = config.package_aliases.get(name.as_str()) {
            stdout.push_str(&format!("{name} is {pkg} (package)\n"));
        } else {
            stdout.push_str(&format!("{name}: not found\n"));
            missing = true;
        }
    }
    StageResult {
        stdout,
        stderr: String::new(),
        exit_code: if missing { 1 } else { 0 },
    }
}

fn seq(args: &[String]) -> StageResult {
    let nums: Result<Vec<i64>, _> = args.iter().map(|a| a.parse::<i64>()).collect();
    let nums = match nums {
        Ok(n) if !n.is_empty() && n.len() <= 3 => n,
        _ => return StageResult::fail("seq: usage: seq [first [incr]] last\n".to_string()),
    };
    // Widen to i128: i64 extremes would overflow both the span check and
    // the counter itself.
    let (first, incr, last): (i128, i128, i128) = match nums.as_slice() {
        [last] => (1, 1, *last as i128),
        [first, last] => {
            let step = if first <= last { 1 } else { -1 };
            (*first as i128, step, *last as i128)
        }
        [first, incr, last] => (*first as i128, *incr as i128, *last as i128),
        _ => unreachable!(),
    };
    if incr == 0 {
        return StageResult::fail("seq: increment must not be zero\n".to_string());
    }
    let span = (last - first) / incr;
    if span >= SEQ_MAX_LINES as i128 {
        return StageResult::fail("seq: range too large\n".to_string());
    }

    let mut out = String::new();
    let mut n = first;
    while (incr > 0 && n <= last) || (incr < 0 && n >= last) {
        out.push_str(&format!("{n}\n"));
        n += incr;
    }
    StageResult::ok(out)
}

async fn sleep(args: &[String]) -> StageResult {
    let seconds = args.first().and_then(|a| a.parse::<f64>().ok());
    match seconds {
        Some(s) if s.is_finite() && s >= 0.0 => {
            tokio::time::sleep(std::time::Duration::from_secs_f64(s)).await;
            StageResult::exit(0)
        }
        _ => StageResult::fail("sleep: invalid time interval\n".to_string()),
    }
}

/// Parses `-n N` / `-nN` / bare `-N` line counts for head and tail.
fn line_count(args: &[String]) -> Result<usize, String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-n" {
            return iter
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| "option -n requires a number".to_string());
        }
        if let Some(value) = arg.strip_prefix("-n") {
            return value.parse().map_err(|_| format!("invalid count {value}"));
        }
        if let Some(value) = arg.strip_prefix('-') {
            if value.chars().all(|c| c.is_ascii_digit()) && !value.is_empty() {
                return value.parse().map_err(|_| format!("invalid count {value}"));
            }
        }
    }
    Ok(10)
}

fn split_lines(text: &str) -> Vec<&str> {
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('\n').collect()
    }
}

fn join_lines(lines: &[&str]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

fn head_tail(args: &[String], stdin: &str, from_end: bool) -> StageResult {
    let n = match line_count(args) {
        Ok(n) => n,
        Err(e) => {
            let cmd = if from_end { "tail" } else { "head" };
            return StageResult::fail(format!("{cmd}: {e}\n"));
        }
    };
    let lines = split_lines(stdin);
    let kept: Vec<&str> = if from_end {
        lines[lines.len().saturating_sub(n)..].to_vec()
    } else {
        lines.iter().take(n).copied().collect()
    };
    StageResult::ok(join_lines(&kept))
}

fn wc(args: &[String], stdin: &str) -> StageResult {
    let lines = stdin.matches('\n').count();
    let words = stdin.split_whitespace().count();
    let bytes = stdin.len();

    let out = match args.first().map(String::as_str) {
        Some("-l") => format!("{lines}\n"),
        Some("-w") => format!("{words}\n"),
        Some("-c") => format!("{bytes}\n"),
        Some(other) => return StageResult::fail(format!("wc: invalid option {other}\n")),
        None => format!("{lines:7} {words:7} {bytes:7}\n"),
    };
    StageResult::ok(out)
}

fn sort(args: &[String], stdin: &str) -> StageResult {
    let reverse = args.iter().any(|a| a == "-r");
    let numeric = args.iter().any(|a| a == "-n");

    let mut lines = split_lines(stdin);
    if numeric {
        // Numeric prefix comparison, like sort -n: non-numeric lines sort as 0.
        lines.sort_by(|a, b| {
            let na = numeric_prefix(a);
            let nb = numeric_prefix(b);
            na.partial_cmp(&nb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
    } else {
        lines.sort_unstable();
    }
    if reverse {
        lines.reverse();
    }
    StageResult::ok(join_lines(&lines))
}

fn numeric_prefix(line: &str) -> f64 {
    let trimmed = line.trim_start();
    let end = trimmed
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    trimmed[..end].parse().unwrap_or(0.0)
}

fn uniq(args: &[String], stdin: &str) -> StageResult {
    let counted = args.iter().any(|a| a == "-c");
    let mut out = String::new();
    let mut previous: Option<&str> = None;
    let mut count = 0usize;

    let flush = |line: &str, count: usize, out: &mut String| {
        if counted {
            out.push_str(&format!("{count:7} {line}\n"));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    };

    for line in split_lines(stdin) {
        match previous {
            Some(prev) if prev == line => count += 1,
            Some(prev) => {
                flush(prev, count, &mut out);
                previous = Some(line);
                count = 1;
            }
            None => {
                previous = Some(line);
                count = 1;
            }
        }
    }
    if let Some(prev) = previous {
        flush(prev, count, &mut out);
    }
    StageResult::ok(out)
}

/// Expands `a-z` style ranges in a tr set.
fn expand_set(set: &str) -> Vec<char> {
    let chars: Vec<char> = set.chars().collect();
    let mut out = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if i + 2 < chars.len() && chars[i + 1] == '-' && chars[i] <= chars[i + 2] {
            for c in chars[i]..=chars[i + 2] {
                out.push(c);
            }
            i += 3;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

fn tr(args: &[String], stdin: &str) -> StageResult {
    if args.first().map(String::as_str) == Some("-d") {
        let Some(set) = args.get(1) else {
            return StageResult::fail("tr: -d requires a set\n".to_string());
        };
        let delete: Vec<char> = expand_set(set);
        let out: String = stdin.chars().filter(|c| !delete.contains(c)).collect();
        return StageResult::ok(out);
    }

    let (Some(from), Some(to)) = (args.first(), args.get(1)) else {
        return StageResult::fail("tr: usage: tr SET1 SET2 | tr -d SET1\n".to_string());
    };
    let from = expand_set(from);
    let to = expand_set(to);
    if to.is_empty() {
        return StageResult::fail("tr: SET2 must not be empty\n".to_string());
    }

    let out: String = stdin
        .chars()
        .map(|c| match from.iter().position(|f| *f == c) {
            // SET2 extends with its last char, as tr does
            Some(i) => *to.get(i).unwrap_or_else(|| to.last().unwrap_or(&c)),
            None => c,
        })
        .collect();
    StageResult::ok(out)
}

fn rev(stdin: &str) -> StageResult {
    let lines: Vec<String> = split_lines(stdin)
        .iter()
        .map(|line| line.chars().rev().collect())
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    StageResult::ok(join_lines(&refs))
}
