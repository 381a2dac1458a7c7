//! GRUB menu configs.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{indent_of, merge_params, names_path, UNATTENDED_PARAMS};
use crate::stages::s03_boot_archive::BootArchive;

/// A top-level `menuentry` or `submenu` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    /// Position among top-level blocks; what `set default=` refers to.
    pub index: usize,
    pub is_submenu: bool,
    linux_line: Option<usize>,
    kernel: Option<String>,
    initrds: Vec<String>,
}

impl MenuEntry {
    pub fn boots_kernel(&self, kernel: &str) -> bool {
        self.kernel.as_deref().is_some_and(|k| names_path(k, kernel))
    }

    pub fn loads_initrd(&self, archive: &str) -> bool {
        self.initrds.iter().any(|p| names_path(p, archive))
    }
}

#[derive(Debug, Default)]
struct Scan {
    entries: Vec<MenuEntry>,
    /// `set timeout=` lines outside any entry.
    timeout_lines: Vec<usize>,
    /// `set default=` lines outside any entry.
    default_lines: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct GrubConfig {
    path: PathBuf,
    lines: Vec<String>,
    trailing_newline: bool,
    changed: bool,
}

impl GrubConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading GRUB config '{}'", path.display()))?;
        Ok(Self::parse(path, &text))
    }

    pub fn parse(path: &Path, text: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            lines: text.lines().map(str::to_string).collect(),
            trailing_newline: text.ends_with('\n'),
            changed: false,
        }
    }

    pub fn entries(&self) -> Vec<MenuEntry> {
        self.scan().entries
    }

    pub fn text(&self) -> String {
        let mut text = self.lines.join("\n");
        if self.trailing_newline {
            text.push('\n');
        }
        text
    }

    fn scan(&self) -> Scan {
        let mut scan = Scan::default();
        let mut depth = 0usize;
        let mut current: Option<usize> = None;

        for (i, line) in self.lines.iter().enumerate() {
            let mut words = line.split_whitespace();
            let first = words.next().unwrap_or_default();

            if depth == 0 && (first == "menuentry" || first == "submenu") {
                scan.entries.push(MenuEntry {
                    index: scan.entries.len(),
                    is_submenu: first == "submenu",
                    linux_line: None,
                    kernel: None,
                    initrds: Vec::new(),
                });
                current = Some(scan.entries.len() - 1);
            } else if let Some(e) = current {
                let entry = &mut scan.entries[e];
                if !entry.is_submenu {
                    match first {
                        "linux" | "linuxefi" if entry.linux_line.is_none() => {
                            entry.linux_line = Some(i);
                            entry.kernel = words.next().map(str::to_string);
                        }
                        "initrd" | "initrdefi" => {
                            entry.initrds.extend(words.map(str::to_string));
                        }
                        _ => {}
                    }
                }
            } else if first == "set" {
                match words.next() {
                    Some(s) if s.starts_with("timeout=") => scan.timeout_lines.push(i),
                    Some(s) if s.starts_with("default=") => scan.default_lines.push(i),
                    _ => {}
                }
            }

            let (opens, closes) = brace_counts(line);
            depth = (depth + opens).saturating_sub(closes);
            if depth == 0 && closes > 0 {
                current = None;
            }
        }
        scan
    }

    /// Add the unattended parameters to the entry booting `archive`, make
    /// it the default and shorten the timeout. Returns the entry's index.
    pub fn patch(&mut self, archive: &BootArchive) -> Result<usize> {
        let scan = self.scan();
        let kernel = archive.layout.kernel;
        let target = scan
            .entries
            .iter()
            .find(|e| e.boots_kernel(kernel) && e.loads_initrd(archive.layout.archive))
            .or_else(|| scan.entries.iter().find(|e| e.boots_kernel(kernel)));
        let Some(target) = target else {
            bail!(
                "no menuentry in '{}' boots {}",
                self.path.display(),
                archive.kernel_boot_path()
            );
        };

        if let Some(i) = target.linux_line {
            let line = &self.lines[i];
            let mut words = line.split_whitespace();
            let keyword = words.next().unwrap_or("linux");
            let path = words.next().unwrap_or_default();
            let args: Vec<&str> = words.collect();
            if let Some(merged) = merge_params(&args.join(" ")) {
                let new = format!("{}{} {} {}", indent_of(line), keyword, path, merged);
                self.replace(i, new);
            }
        }

        let mut header = Vec::new();
        if scan.timeout_lines.is_empty() {
            header.push("set timeout=1".to_string());
        }
        for &i in &scan.timeout_lines {
            let new = format!("{}set timeout=1", indent_of(&self.lines[i]));
            self.replace(i, new);
        }
        if scan.default_lines.is_empty() {
            header.push(format!("set default={}", target.index));
        }
        for &i in &scan.default_lines {
            let new = format!("{}set default={}", indent_of(&self.lines[i]), target.index);
            self.replace(i, new);
        }
        if !header.is_empty() {
            self.lines.splice(0..0, header);
            self.changed = true;
        }

        Ok(target.index)
    }

    fn replace(&mut self, line: usize, text: String) {
        if self.lines[line] != text {
            self.lines[line] = text;
            self.changed = true;
        }
    }

    /// Write the file back if it changed.
    pub fn save(&mut self) -> Result<bool> {
        if !self.changed {
            return Ok(false);
        }
        fs::write(&self.path, self.text())
            .with_context(|| format!("writing GRUB config '{}'", self.path.display()))?;
        self.changed = false;
        Ok(true)
    }
}

/// Minimal GRUB config booting the archive unattended.
pub fn author(archive: &BootArchive) -> String {
    format!(
        "set timeout=1\n\
         set default=0\n\
         \n\
         menuentry 'Unattended install' {{\n\
         \tlinux {kernel} {params} --- quiet\n\
         \tinitrd {initrd}\n\
         }}\n",
        kernel = archive.kernel_boot_path(),
        initrd = archive.boot_path(),
        params = UNATTENDED_PARAMS.join(" "),
    )
}

/// Unquoted, uncommented braces on one line.
fn brace_counts(line: &str) -> (usize, usize) {
    let (mut opens, mut closes) = (0, 0);
    let mut quote: Option<char> = None;
    let mut prev_blank = true;
    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '#' if prev_blank => break,
                '{' => opens += 1,
                '}' => closes += 1,
                _ => {}
            },
        }
        prev_blank = c.is_whitespace();
    }
    (opens, closes)
}
