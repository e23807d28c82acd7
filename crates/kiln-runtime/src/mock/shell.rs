//! A small POSIX-like shell over [`MockFs`].
//!
//! Supports `;`, `&&`, `||`, newlines, comments, single and double quotes,
//! `$VAR`/`${VAR}` expansion, wildcards in the final path component, `>` and
//! `>>` redirection, leading `VAR=value` assignments and `set -e`/`set -x`.
//! Pipes and subshells are not supported.

use super::deb::PackageIndex;
use super::fs::{normalize, Entry, Mounted, MockFs};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const MAX_SCRIPT_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    Seq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal { text: String, quoted: bool },
    Var(String),
}

type Word = Vec<Part>;

#[derive(Debug, Default)]
struct Command {
    words: Vec<Word>,
    redirect: Option<(bool, Word)>,
}

#[derive(Debug)]
enum Token {
    Word(Word),
    Op(Connector),
    Redirect { append: bool },
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(script: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = script.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\n' | ';' => {
                tokens.push(Token::Op(Connector::Seq));
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::Op(Connector::And));
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Op(Connector::Or));
                i += 2;
            }
            '|' | '&' => return Err(format!("unsupported operator '{c}'")),
            '>' => {
                let append = chars.get(i + 1) == Some(&'>');
                tokens.push(Token::Redirect { append });
                i += if append { 2 } else { 1 };
            }
            _ => {
                let (word, next) = read_word(&chars, i)?;
                tokens.push(Token::Word(word));
                i = next;
            }
        }
    }
    Ok(tokens)
}

fn push_literal(word: &mut Word, ch: char, quoted: bool) {
    if let Some(Part::Literal { text, quoted: q }) = word.last_mut() {
        if *q == quoted {
            text.push(ch);
            return;
        }
    }
    word.push(Part::Literal {
        text: ch.to_string(),
        quoted,
    });
}

fn read_var(chars: &[char], mut i: usize) -> Result<(Option<String>, usize), String> {
    if chars.get(i) == Some(&'{') {
        let start = i + 1;
        while i < chars.len() && chars[i] != '}' {
            i += 1;
        }
        if i >= chars.len() {
            return Err("unterminated ${".to_owned());
        }
        return Ok((Some(chars[start..i].iter().collect()), i + 1));
    }
    let start = i;
    while i < chars.len() && is_name_char(chars[i]) {
        i += 1;
    }
    if start == i {
        Ok((None, i))
    } else {
        Ok((Some(chars[start..i].iter().collect()), i))
    }
}

fn read_word(chars: &[char], mut i: usize) -> Result<(Word, usize), String> {
    let mut word = Word::new();
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' | ';' | '&' | '|' | '>' => break,
            '\'' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '\'' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated single quote".to_owned());
                }
                word.push(Part::Literal {
                    text: chars[start..i].iter().collect(),
                    quoted: true,
                });
                i += 1;
            }
            '"' => {
                i += 1;
                // An empty "" still yields a word.
                word.push(Part::Literal {
                    text: String::new(),
                    quoted: true,
                });
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated double quote".to_owned()),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if matches!(chars.get(i + 1), Some('"' | '\\' | '$')) => {
                            push_literal(&mut word, chars[i + 1], true);
                            i += 2;
                        }
                        Some('$') => {
                            let (name, next) = read_var(chars, i + 1)?;
                            match name {
                                Some(n) => word.push(Part::Var(n)),
                                None => push_literal(&mut word, '$', true),
                            }
                            i = next;
                        }
                        Some(&other) => {
                            push_literal(&mut word, other, true);
                            i += 1;
                        }
                    }
                }
            }
            '\\' => {
                match chars.get(i + 1) {
                    Some('\n') => {}
                    Some(&next) => push_literal(&mut word, next, true),
                    None => {}
                }
                i += 2;
            }
            '$' => {
                let (name, next) = read_var(chars, i + 1)?;
                match name {
                    Some(n) => word.push(Part::Var(n)),
                    None => push_literal(&mut word, '$', false),
                }
                i = next;
            }
            other => {
                push_literal(&mut word, other, false);
                i += 1;
            }
        }
    }
    Ok((word, i))
}

fn parse(script: &str) -> Result<Vec<(Connector, Command)>, String> {
    let mut out = Vec::new();
    let mut current = Command::default();
    let mut connector = Connector::Seq;
    let mut tokens = tokenize(script)?.into_iter();

    while let Some(token) = tokens.next() {
        match token {
            Token::Word(w) => current.words.push(w),
            Token::Redirect { append } => match tokens.next() {
                Some(Token::Word(target)) => current.redirect = Some((append, target)),
                _ => return Err("syntax error: redirection without target".to_owned()),
            },
            Token::Op(op) => {
                if current.words.is_empty() {
                    if op != Connector::Seq {
                        return Err("syntax error near unexpected operator".to_owned());
                    }
                    continue;
                }
                out.push((connector, std::mem::take(&mut current)));
                connector = op;
            }
        }
    }
    if !current.words.is_empty() {
        out.push((connector, current));
    }
    Ok(out)
}

/// Static facts about the machine a shell runs on.
#[derive(Debug, Clone, Copy)]
pub struct World<'a> {
    /// What remote apt sources serve.
    pub archive: &'a PackageIndex,
    pub arch: &'a str,
}

pub struct Shell<'a> {
    pub(super) fs: &'a mut MockFs,
    pub(super) world: World<'a>,
    pub(super) cwd: String,
    pub(super) env: BTreeMap<String, String>,
    mounts: Vec<String>,
    stdout: String,
    pub(super) stderr: String,
    errexit: bool,
    xtrace: bool,
    exited: Option<i32>,
    depth: usize,
}

impl<'a> Shell<'a> {
    pub fn new(fs: &'a mut MockFs, world: World<'a>) -> Self {
        Self {
            fs,
            world,
            cwd: "/".to_owned(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            errexit: false,
            xtrace: false,
            exited: None,
            depth: 0,
        }
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_cwd(mut self, cwd: Option<&str>) -> Self {
        if let Some(dir) = cwd {
            self.cwd = normalize("/", dir);
        }
        self
    }

    /// Lines reported by `mount`.
    pub fn with_mounts(mut self, mounts: Vec<String>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn output(self) -> (String, String) {
        (self.stdout, self.stderr)
    }

    pub(super) fn path(&self, p: &str) -> String {
        normalize(&self.cwd, p)
    }

    /// Run an exec's argv: `sh -c <script>` or a single command.
    pub fn run_args(&mut self, args: &[String]) -> i32 {
        match args {
            [sh, flag, script, ..] if is_shell(sh) && flag == "-c" => self.run_script(script),
            [] => 0,
            words => {
                let mut out = String::new();
                let status = self.dispatch(words, &mut out);
                self.stdout.push_str(&out);
                status
            }
        }
    }

    pub fn run_script(&mut self, script: &str) -> i32 {
        let commands = match parse(script) {
            Ok(c) => c,
            Err(e) => {
                let _ = writeln!(self.stderr, "sh: {e}");
                return 2;
            }
        };

        let mut status = 0;
        for (i, (connector, command)) in commands.iter().enumerate() {
            let skip = match connector {
                Connector::Seq => false,
                Connector::And => status != 0,
                Connector::Or => status == 0,
            };
            if skip {
                continue;
            }
            status = self.execute(command);
            if let Some(code) = self.exited {
                return code;
            }
            let guarded = matches!(
                commands.get(i + 1),
                Some((Connector::And | Connector::Or, _))
            );
            if self.errexit && status != 0 && !guarded {
                return status;
            }
        }
        status
    }

    fn expand(&self, word: &Word) -> (String, bool) {
        let mut text = String::new();
        let mut glob = false;
        for part in word {
            match part {
                Part::Literal { text: t, quoted } => {
                    if !quoted && t.contains(['*', '?']) {
                        glob = true;
                    }
                    text.push_str(t);
                }
                Part::Var(name) => {
                    text.push_str(self.env.get(name).map_or("", String::as_str));
                }
            }
        }
        (text, glob)
    }

    fn execute(&mut self, command: &Command) -> i32 {
        let mut words = Vec::new();
        for word in &command.words {
            let (text, glob) = self.expand(word);
            if glob {
                let matches = self.fs.glob(&self.path(&text));
                if matches.is_empty() {
                    words.push(text);
                } else if text.starts_with('/') {
                    words.extend(matches);
                } else {
                    let prefix = if self.cwd == "/" {
                        "/".to_owned()
                    } else {
                        format!("{}/", self.cwd)
                    };
                    words.extend(
                        matches
                            .into_iter()
                            .map(|m| m.strip_prefix(&prefix).map_or(m.clone(), str::to_owned)),
                    );
                }
            } else if !(text.is_empty() && word.iter().all(|p| matches!(p, Part::Var(_)))) {
                words.push(text);
            }
        }

        // Leading NAME=value assignments apply to this command only.
        let mut saved = Vec::new();
        while let Some(first) = words.first() {
            let Some((name, value)) = first.split_once('=') else {
                break;
            };
            if name.is_empty() || !name.chars().all(is_name_char) {
                break;
            }
            saved.push((name.to_owned(), self.env.insert(name.to_owned(), value.to_owned())));
            words.remove(0);
        }
        if words.is_empty() {
            // A bare assignment persists.
            return 0;
        }

        if self.xtrace {
            let _ = writeln!(self.stderr, "+ {}", words.join(" "));
        }

        let mut out = String::new();
        let status = self.dispatch(&words, &mut out);

        for (name, previous) in saved.into_iter().rev() {
            match previous {
                Some(v) => self.env.insert(name, v),
                None => self.env.remove(&name),
            };
        }

        match &command.redirect {
            Some((append, target)) => {
                let (target, _) = self.expand(target);
                let path = self.path(&target);
                if *append {
                    self.fs.append_file(&path, out.as_bytes());
                } else {
                    self.fs.write_file(&path, out, 0o644);
                }
            }
            None => self.stdout.push_str(&out),
        }
        status
    }

    fn fail(&mut self, msg: impl AsRef<str>, status: i32) -> i32 {
        let _ = writeln!(self.stderr, "{}", msg.as_ref());
        status
    }

    fn dispatch(&mut self, words: &[String], out: &mut String) -> i32 {
        let (name, args) = match words.split_first() {
            Some((n, a)) => (n.rsplit('/').next().unwrap_or(n), a),
            None => return 0,
        };
        match name {
            "true" | ":" => 0,
            "false" => 1,
            "set" => self.set(args),
            "exit" => {
                let code = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
                self.exited = Some(code);
                code
            }
            "export" => {
                for arg in args {
                    if let Some((k, v)) = arg.split_once('=') {
                        self.env.insert(k.to_owned(), v.to_owned());
                    }
                }
                0
            }
            "cd" => self.cd(args),
            "echo" => {
                let (newline, rest) = match args.first().map(String::as_str) {
                    Some("-n") => (false, &args[1..]),
                    _ => (true, args),
                };
                out.push_str(&rest.join(" "));
                if newline {
                    out.push('\n');
                }
                0
            }
            "cat" => self.cat(args, out),
            "ls" => self.ls(args, out),
            "mount" => {
                for line in &self.mounts {
                    let _ = writeln!(out, "{line}");
                }
                0
            }
            "mkdir" => self.mkdir(args),
            "rm" => self.rm(args),
            "cp" => self.cp(args, false),
            "mv" => self.cp(args, true),
            "ln" => self.ln(args),
            "chmod" => self.chmod(args),
            "sh" | "bash" => self.sh(args, out),
            "apt" | "apt-get" => self.apt(args, out),
            "dpkg" => self.dpkg(args, out),
            "aptitude" => self.aptitude(args, out),
            "mmdebstrap" => self.mmdebstrap(args, out),
            "dpkg-buildpackage" => self.dpkg_buildpackage(args, out),
            other => self.fail(format!("sh: 1: {other}: not found"), 127),
        }
    }

    fn set(&mut self, args: &[String]) -> i32 {
        for arg in args {
            let (on, flags) = match arg.strip_prefix('-') {
                Some(f) => (true, f),
                None => match arg.strip_prefix('+') {
                    Some(f) => (false, f),
                    None => continue,
                },
            };
            for flag in flags.chars() {
                match flag {
                    'e' => self.errexit = on,
                    'x' => self.xtrace = on,
                    _ => {}
                }
            }
        }
        0
    }

    fn cd(&mut self, args: &[String]) -> i32 {
        let target = self.path(args.first().map_or("/", String::as_str));
        if !self.fs.is_dir(&target) {
            return self.fail(format!("sh: 1: cd: can't cd to {target}"), 2);
        }
        self.cwd = target;
        0
    }

    fn cat(&mut self, args: &[String], out: &mut String) -> i32 {
        let mut status = 0;
        for arg in args {
            match self.fs.read_string(&self.path(arg)) {
                Some(text) => out.push_str(&text),
                None => status = self.fail(format!("cat: {arg}: No such file or directory"), 1),
            }
        }
        status
    }

    fn ls(&mut self, args: &[String], out: &mut String) -> i32 {
        let long = args
            .iter()
            .any(|a| a.starts_with('-') && a.contains('l'));
        let cwd = self.cwd.clone();
        let mut paths: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
        if paths.is_empty() {
            paths.push(&cwd);
        }

        let mut status = 0;
        for arg in paths {
            let path = self.path(arg);
            match self.fs.stat(&path) {
                None => {
                    status = self.fail(
                        format!("ls: cannot access '{arg}': No such file or directory"),
                        2,
                    );
                }
                Some(Entry::Dir { .. }) => {
                    let names = self.fs.list(&path);
                    if long {
                        let _ = writeln!(out, "total {}", names.len());
                    }
                    for name in names {
                        let child = normalize(&path, &name);
                        self.ls_line(&child, &name, long, out);
                    }
                }
                Some(_) => self.ls_line(&path, arg, long, out),
            }
        }
        status
    }

    fn ls_line(&self, path: &str, name: &str, long: bool, out: &mut String) {
        if !long {
            let _ = writeln!(out, "{name}");
            return;
        }
        let (kind, size, suffix) = match self.fs.lstat(path) {
            Some(Entry::Dir { .. }) => ('d', 4096, String::new()),
            Some(Entry::File { data, .. }) => ('-', data.len(), String::new()),
            Some(Entry::Symlink { target }) => ('l', target.len(), format!(" -> {target}")),
            None => return,
        };
        let mode = self.fs.lstat(path).map_or(0, Entry::mode);
        let _ = writeln!(
            out,
            "{kind}{} 1 root root {size} {name}{suffix}",
            mode_string(mode)
        );
    }

    fn mkdir(&mut self, args: &[String]) -> i32 {
        let parents = args.iter().any(|a| a == "-p");
        let mut status = 0;
        for arg in args.iter().filter(|a| !a.starts_with('-')) {
            let path = self.path(arg);
            if self.fs.exists(&path) {
                if !parents {
                    status = self.fail(format!("mkdir: cannot create directory '{arg}': File exists"), 1);
                }
                continue;
            }
            let parent_ok = path
                .rsplit_once('/')
                .is_some_and(|(p, _)| p.is_empty() || self.fs.is_dir(p));
            if !parents && !parent_ok {
                status = self.fail(
                    format!("mkdir: cannot create directory '{arg}': No such file or directory"),
                    1,
                );
                continue;
            }
            self.fs.mkdir_all(&path, 0o755);
        }
        status
    }

    fn rm(&mut self, args: &[String]) -> i32 {
        let flags: String = args
            .iter()
            .filter(|a| a.starts_with('-'))
            .flat_map(|a| a.chars().skip(1))
            .collect();
        let recursive = flags.contains(['r', 'R']);
        let force = flags.contains('f');
        let mut status = 0;
        for arg in args.iter().filter(|a| !a.starts_with('-')) {
            let path = self.path(arg);
            match self.fs.lstat(&path) {
                None if force => {}
                None => {
                    status = self.fail(format!("rm: cannot remove '{arg}': No such file or directory"), 1);
                }
                Some(Entry::Dir { .. }) if !recursive => {
                    status = self.fail(format!("rm: cannot remove '{arg}': Is a directory"), 1);
                }
                Some(_) => {
                    self.fs.remove(&path);
                }
            }
        }
        status
    }

    fn cp(&mut self, args: &[String], remove_source: bool) -> i32 {
        let recursive = remove_source
            || args
                .iter()
                .any(|a| a.starts_with('-') && a.contains(['r', 'R', 'a']));
        let operands: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
        let tool = if remove_source { "mv" } else { "cp" };
        let Some((dest, sources)) = operands.split_last() else {
            return self.fail(format!("{tool}: missing file operand"), 1);
        };
        if sources.is_empty() {
            return self.fail(format!("{tool}: missing destination file operand after '{dest}'"), 1);
        }

        let dest_path = self.path(dest);
        let dest_is_dir = self.fs.is_dir(&dest_path);
        if sources.len() > 1 && !dest_is_dir {
            return self.fail(format!("{tool}: target '{dest}' is not a directory"), 1);
        }

        let mut status = 0;
        for src in sources {
            let src_path = self.path(src);
            let Some(entry) = self.fs.lstat(&src_path).cloned() else {
                status = self.fail(
                    format!("{tool}: cannot stat '{src}': No such file or directory"),
                    1,
                );
                continue;
            };
            let target = if dest_is_dir {
                let base = src_path.rsplit('/').next().unwrap_or_default();
                normalize(&dest_path, base)
            } else {
                dest_path.clone()
            };
            if entry.is_dir() {
                if !recursive {
                    status = self.fail(format!("{tool}: -r not specified; omitting directory '{src}'"), 1);
                    continue;
                }
                let tree = self.fs.subtree(&src_path);
                self.fs.mkdir_all(&target, entry.mode());
                self.fs.graft(&target, &Mounted::Tree(tree));
            } else {
                self.fs.insert(&target, entry);
            }
            if remove_source {
                self.fs.remove(&src_path);
            }
        }
        status
    }

    fn ln(&mut self, args: &[String]) -> i32 {
        let flags: String = args
            .iter()
            .filter(|a| a.starts_with('-'))
            .flat_map(|a| a.chars().skip(1))
            .collect();
        let operands: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
        let [target, link] = operands.as_slice() else {
            return self.fail("ln: expected TARGET and LINK_NAME", 1);
        };

        let mut link_path = self.path(link);
        if self.fs.is_dir(&link_path) && !matches!(self.fs.lstat(&link_path), Some(Entry::Symlink { .. })) {
            let base = target.rsplit('/').next().unwrap_or_default();
            link_path = normalize(&link_path, base);
        }
        if self.fs.exists(&link_path) {
            if !flags.contains('f') {
                return self.fail(
                    format!("ln: failed to create symbolic link '{link}': File exists"),
                    1,
                );
            }
            self.fs.remove(&link_path);
        }

        if flags.contains('s') {
            self.fs.symlink(&link_path, target);
            return 0;
        }
        match self.fs.stat(&self.path(target)).cloned() {
            Some(entry) if !entry.is_dir() => {
                self.fs.insert(&link_path, entry);
                0
            }
            _ => self.fail(format!("ln: failed to access '{target}'"), 1),
        }
    }

    fn chmod(&mut self, args: &[String]) -> i32 {
        let operands: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
        let Some((mode, paths)) = operands.split_first() else {
            return self.fail("chmod: missing operand", 1);
        };
        let mut status = 0;
        for p in paths {
            let path = self.path(p);
            let current = self.fs.stat(&path).map(Entry::mode);
            let new_mode = match (mode.as_str(), current) {
                (_, None) => {
                    status = self.fail(format!("chmod: cannot access '{p}': No such file or directory"), 1);
                    continue;
                }
                ("+x", Some(m)) => m | 0o111,
                ("-x", Some(m)) => m & !0o111,
                (octal, Some(_)) => match u32::from_str_radix(octal, 8) {
                    Ok(m) => m,
                    Err(_) => return self.fail(format!("chmod: invalid mode: '{octal}'"), 1),
                },
            };
            self.fs.set_mode(&path, new_mode);
        }
        status
    }

    fn sh(&mut self, args: &[String], out: &mut String) -> i32 {
        let script = match args {
            [flag, script, ..] if flag == "-c" => script.clone(),
            [file, ..] => match self.fs.read_string(&self.path(file)) {
                Some(text) => text,
                None => return self.fail(format!("sh: 0: cannot open {file}: No such file"), 2),
            },
            [] => return 0,
        };
        self.nested(&script, out)
    }

    /// Run `script` in a child shell starting in `cwd`.
    pub(super) fn run_in(&mut self, cwd: &str, script: &str, out: &mut String) -> i32 {
        let saved = std::mem::replace(&mut self.cwd, cwd.to_owned());
        let status = self.nested(script, out);
        self.cwd = saved;
        status
    }

    /// Child shells share the filesystem and environment but not options,
    /// `exit` or the working directory.
    fn nested(&mut self, script: &str, out: &mut String) -> i32 {
        if self.depth >= MAX_SCRIPT_DEPTH {
            return self.fail("sh: nesting too deep", 2);
        }
        let (errexit, xtrace, exited) = (self.errexit, self.xtrace, self.exited.take());
        let cwd = self.cwd.clone();
        let stdout = std::mem::take(&mut self.stdout);
        self.depth += 1;
        let status = self.run_script(script);
        self.depth -= 1;
        out.push_str(&std::mem::replace(&mut self.stdout, stdout));
        self.errexit = errexit;
        self.xtrace = xtrace;
        self.exited = exited;
        self.cwd = cwd;
        status
    }
}

fn is_shell(arg: &str) -> bool {
    matches!(arg.rsplit('/').next(), Some("sh" | "bash" | "dash"))
}

fn mode_string(mode: u32) -> String {
    let mut s = String::with_capacity(9);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fs: &mut MockFs, script: &str) -> (i32, String, String) {
        let archive = PackageIndex::new();
        let world = World {
            archive: &archive,
            arch: "amd64",
        };
        let mut shell = Shell::new(fs, world);
        let status = shell.run_script(script);
        let (out, err) = shell.output();
        (status, out, err)
    }

    #[test]
    fn sequences_and_conditionals() {
        let mut fs = MockFs::new();
        let (status, out, _) = run(&mut fs, "false && echo no; true || echo no; echo yes");
        assert_eq!(status, 0);
        assert_eq!(out, "yes\n");

        let (status, out, _) = run(&mut fs, "false || echo fallback");
        assert_eq!((status, out.as_str()), (0, "fallback\n"));
    }

    #[test]
    fn errexit_stops_unless_guarded() {
        let mut fs = MockFs::new();
        let (status, out, _) = run(&mut fs, "set -e; false; echo unreachable");
        assert_eq!(status, 1);
        assert!(out.is_empty());

        let (status, out, _) = run(&mut fs, "set -e; false && true; echo reached");
        assert_eq!(status, 0);
        assert_eq!(out, "reached\n");
    }

    #[test]
    fn exit_codes_and_diagnostic_pattern() {
        let mut fs = MockFs::new();
        let (status, out, _) = run(&mut fs, "true && exit 0; echo diag; exit 42");
        assert_eq!((status, out.as_str()), (0, ""));
        let (status, out, _) = run(&mut fs, "false && exit 0; echo diag; exit 42");
        assert_eq!((status, out.as_str()), (42, "diag\n"));
    }

    #[test]
    fn quoting_variables_and_redirects() {
        let mut fs = MockFs::new();
        let (status, _, _) = run(
            &mut fs,
            "export NAME=world\nmkdir -p /out\necho \"hello $NAME\" 'lit $NAME' > /out/a\necho more >> /out/a",
        );
        assert_eq!(status, 0);
        assert_eq!(
            fs.read_string("/out/a").unwrap(),
            "hello world lit $NAME\nmore\n"
        );
    }

    #[test]
    fn prefix_assignment_is_scoped() {
        let mut fs = MockFs::new();
        let (_, out, _) = run(&mut fs, "A=1 sh -c 'echo $A'; echo \"[$A]\"");
        assert_eq!(out, "1\n[]\n");
    }

    #[test]
    fn globs_expand_against_fs() {
        let mut fs = MockFs::new();
        fs.write_file("/tmp/pkg/a.deb", "", 0o644);
        fs.write_file("/tmp/pkg/b.deb", "", 0o644);
        let (_, out, _) = run(&mut fs, "cd /tmp/pkg && echo *.deb; echo '*.deb'");
        assert_eq!(out, "a.deb b.deb\n*.deb\n");

        let (_, out, _) = run(&mut fs, "echo /tmp/pkg/*.deb");
        assert_eq!(out, "/tmp/pkg/a.deb /tmp/pkg/b.deb\n");
    }

    #[test]
    fn file_utilities() {
        let mut fs = MockFs::new();
        let (status, out, err) = run(
            &mut fs,
            "set -e\nmkdir -p /src/bin /dst\necho x > /src/bin/foo\nchmod 0755 /src/bin/foo\n\
             cp -r /src/bin /dst\nmv /dst/bin/foo /dst/foo\nln -sf /dst/foo /dst/link\nls -l /dst\nrm -rf /src",
        );
        assert_eq!(status, 0, "{err}");
        assert!(!fs.exists("/src"));
        assert_eq!(fs.stat("/dst/foo").unwrap().mode(), 0o755);
        assert_eq!(fs.read_string("/dst/link").unwrap(), "x\n");
        assert!(out.contains("-rwxr-xr-x 1 root root 2 foo"));
        assert!(out.contains("link -> /dst/foo"));
    }

    #[test]
    fn missing_paths_fail() {
        let mut fs = MockFs::new();
        let (status, _, err) = run(&mut fs, "ls -lh /opt/testrepo");
        assert_eq!(status, 2);
        assert!(err.contains("cannot access '/opt/testrepo'"));
        let (status, _, err) = run(&mut fs, "frobnicate");
        assert_eq!(status, 127);
        assert!(err.contains("frobnicate: not found"));
    }

    #[test]
    fn xtrace_echoes_commands() {
        let mut fs = MockFs::new();
        let (_, _, err) = run(&mut fs, "set -x; echo hi");
        assert!(err.contains("+ echo hi"));
    }

    #[test]
    fn sh_runs_script_files() {
        let mut fs = MockFs::new();
        fs.write_file("/build.sh", "set -e\necho building\nexit 3\necho never\n", 0o755);
        let (status, out, _) = run(&mut fs, "sh /build.sh; echo after");
        assert_eq!(status, 0);
        assert_eq!(out, "building\nafter\n");
    }

    #[test]
    fn syntax_errors_are_reported() {
        let mut fs = MockFs::new();
        let (status, _, err) = run(&mut fs, "echo 'unterminated");
        assert_eq!(status, 2);
        assert!(err.contains("unterminated"));
    }
}
