//! syslinux/isolinux menu configs.
//!
//! Installer images either keep everything in one file or split the menu
//! across a chain of `include`d files (Debian's isolinux.cfg includes
//! menu.cfg, which includes gtk.cfg, txt.cfg and friends). The whole chain
//! is loaded in traversal order so entries, the `default` directive and
//! `menu default` markers can be edited wherever they live.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::{indent_of, merge_params, names_path, UNATTENDED_PARAMS};
use crate::stages::s03_boot_archive::BootArchive;

/// How the menu is spread over files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    SelfContained,
    /// The primary pulls in these files, in traversal order.
    Chained { included: Vec<PathBuf> },
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfContained => f.write_str("self-contained"),
            Self::Chained { included } => write!(f, "chained ({} included files)", included.len()),
        }
    }
}

#[derive(Debug, Clone)]
struct MenuFile {
    path: PathBuf,
    lines: Vec<String>,
    trailing_newline: bool,
    changed: bool,
}

/// One `label` block.
#[derive(Debug, Clone)]
pub struct Entry {
    pub label: String,
    file: usize,
    label_line: usize,
    /// Last line belonging to the entry.
    last_line: usize,
    append_line: Option<usize>,
    menu_default_line: Option<usize>,
    /// Paths named by `initrd=` parameters and `initrd` directives.
    initrds: Vec<String>,
}

impl Entry {
    pub fn references(&self, archive: &str) -> bool {
        self.initrds.iter().any(|p| names_path(p, archive))
    }

    pub fn is_menu_default(&self) -> bool {
        self.menu_default_line.is_some()
    }
}

#[derive(Debug, Clone)]
struct Directive {
    file: usize,
    line: usize,
    value: String,
}

enum Edit {
    Insert { file: usize, at: usize, text: String },
    Remove { file: usize, line: usize },
}

impl Edit {
    fn position(&self) -> (usize, usize) {
        match self {
            Self::Insert { file, at, .. } => (*file, *at),
            Self::Remove { file, line } => (*file, *line),
        }
    }
}

/// A legacy menu and every file it includes.
#[derive(Debug, Clone)]
pub struct LegacyMenu {
    files: Vec<MenuFile>,
    entries: Vec<Entry>,
    /// Effective `default` directive; the last one read wins.
    default: Option<Directive>,
    /// `timeout` line in the primary file.
    timeout: Option<usize>,
}

impl LegacyMenu {
    /// Load `primary` and follow its includes. Missing includes are skipped;
    /// a file already in the chain is never read twice.
    pub fn load(tree: &Path, primary: &Path) -> Result<Self> {
        let mut menu = Self {
            files: Vec::new(),
            entries: Vec::new(),
            default: None,
            timeout: None,
        };
        let mut visited = HashSet::new();
        menu.parse_file(tree, primary, &mut visited)?;
        Ok(menu)
    }

    pub fn shape(&self) -> Shape {
        if self.files.len() == 1 {
            Shape::SelfContained
        } else {
            Shape::Chained {
                included: self.files[1..].iter().map(|f| f.path.clone()).collect(),
            }
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Label named by the `default` directive, unless it names a menu module.
    pub fn default_label(&self) -> Option<&str> {
        self.default
            .as_ref()
            .map(|d| d.value.as_str())
            .filter(|v| !is_module(v))
    }

    fn parse_file(&mut self, tree: &Path, path: &Path, visited: &mut HashSet<PathBuf>) -> Result<()> {
        if !visited.insert(path.to_path_buf()) {
            tracing::debug!(path = %path.display(), "include cycle, not following");
            return Ok(());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading boot menu '{}'", path.display()))?;
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let file = self.files.len();
        self.files.push(MenuFile {
            path: path.to_path_buf(),
            lines: lines.clone(),
            trailing_newline: text.ends_with('\n'),
            changed: false,
        });

        let mut current: Option<usize> = None;
        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut words = trimmed.split_whitespace();
            let first = words.next().unwrap_or_default();
            let rest = trimmed[first.len()..].trim();

            match first.to_ascii_lowercase().as_str() {
                "label" => {
                    self.entries.push(Entry {
                        label: rest.to_string(),
                        file,
                        label_line: i,
                        last_line: i,
                        append_line: None,
                        menu_default_line: None,
                        initrds: Vec::new(),
                    });
                    current = Some(self.entries.len() - 1);
                }
                "include" => {
                    current = None;
                    if let Some(target) = words.next() {
                        self.follow_include(tree, path, target, visited)?;
                    }
                }
                "menu" => {
                    let sub = words.next().unwrap_or_default().to_ascii_lowercase();
                    match sub.as_str() {
                        "include" => {
                            current = None;
                            if let Some(target) = words.next() {
                                self.follow_include(tree, path, target, visited)?;
                            }
                        }
                        "begin" | "end" => current = None,
                        "default" => {
                            if let Some(e) = current {
                                self.entries[e].menu_default_line = Some(i);
                                self.entries[e].last_line = i;
                            }
                        }
                        _ => {
                            if let Some(e) = current {
                                self.entries[e].last_line = i;
                            }
                        }
                    }
                }
                "default" => {
                    if let Some(value) = words.next() {
                        self.default = Some(Directive {
                            file,
                            line: i,
                            value: value.to_string(),
                        });
                    }
                }
                "timeout" => {
                    if file == 0 {
                        self.timeout = Some(i);
                    }
                }
                "append" => {
                    if let Some(e) = current {
                        let entry = &mut self.entries[e];
                        entry.append_line = Some(i);
                        entry.last_line = i;
                        entry.initrds.extend(
                            words
                                .filter_map(|w| w.strip_prefix("initrd="))
                                .flat_map(|v| v.split(','))
                                .map(str::to_string),
                        );
                    }
                }
                "initrd" => {
                    if let Some(e) = current {
                        let entry = &mut self.entries[e];
                        entry.last_line = i;
                        entry.initrds.extend(
                            rest.split([',', ' ', '\t'])
                                .filter(|p| !p.is_empty())
                                .map(str::to_string),
                        );
                    }
                }
                _ => {
                    if let Some(e) = current {
                        self.entries[e].last_line = i;
                    }
                }
            }
        }
        Ok(())
    }

    fn follow_include(
        &mut self,
        tree: &Path,
        including: &Path,
        target: &str,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        match resolve_include(tree, including, target) {
            Some(path) => self.parse_file(tree, &path, visited),
            None => {
                tracing::warn!(include = target, from = %including.display(), "included menu file not found");
                Ok(())
            }
        }
    }

    /// Entry the unattended parameters go into.
    ///
    /// Among entries booting `archive`, prefer the one marked `menu default`,
    /// then the `default` label, then the first. With no entry booting it,
    /// the same preference applies to all entries.
    pub fn select_target(&self, archive: &str) -> Option<usize> {
        let referencing: Vec<usize> = (0..self.entries.len())
            .filter(|&e| self.entries[e].references(archive))
            .collect();
        if !referencing.is_empty() {
            return self.prefer(&referencing);
        }
        let all: Vec<usize> = (0..self.entries.len()).collect();
        self.prefer(&all)
    }

    fn prefer(&self, candidates: &[usize]) -> Option<usize> {
        let default_label = self.default_label();
        candidates
            .iter()
            .copied()
            .find(|&e| self.entries[e].is_menu_default())
            .or_else(|| {
                default_label.and_then(|label| {
                    candidates
                        .iter()
                        .copied()
                        .find(|&e| self.entries[e].label.eq_ignore_ascii_case(label))
                })
            })
            .or_else(|| candidates.first().copied())
    }

    /// Add the unattended parameters to the target entry, make it the
    /// default and shorten the timeout. Returns the target's label.
    pub fn patch(&mut self, archive: &BootArchive) -> Result<String> {
        let target = self
            .select_target(archive.layout.archive)
            .with_context(|| format!("no boot entries in '{}'", self.files[0].path.display()))?;
        let entry = self.entries[target].clone();
        if !entry.references(archive.layout.archive) {
            tracing::warn!(label = %entry.label, "no legacy entry boots the archive; patching the default entry");
        }

        let mut edits = Vec::new();
        self.patch_append(&entry, archive, &mut edits);
        self.make_default(target, &mut edits);
        self.set_timeout(&mut edits);
        self.apply(edits);
        Ok(entry.label)
    }

    fn patch_append(&mut self, entry: &Entry, archive: &BootArchive, edits: &mut Vec<Edit>) {
        match entry.append_line {
            Some(i) => {
                let line = &self.files[entry.file].lines[i];
                let keyword = line.split_whitespace().next().unwrap_or("append");
                let args = line.trim_start()[keyword.len()..].trim();
                if let Some(merged) = merge_params(args) {
                    let new = format!("{}{} {}", indent_of(line), keyword, merged);
                    self.replace(entry.file, i, new);
                }
            }
            None => {
                let indent = self.body_indent(entry);
                let mut params = UNATTENDED_PARAMS.join(" ");
                if !entry.references(archive.layout.archive) && entry.initrds.is_empty() {
                    params = format!("initrd={} {}", archive.boot_path(), params);
                }
                edits.push(Edit::Insert {
                    file: entry.file,
                    at: entry.last_line + 1,
                    text: format!("{indent}append {params}"),
                });
            }
        }
    }

    fn make_default(&mut self, target: usize, edits: &mut Vec<Edit>) {
        let label = self.entries[target].label.clone();
        let module_default = self.default.as_ref().is_some_and(|d| is_module(&d.value));
        let had_markers = self.entries.iter().any(Entry::is_menu_default);

        match self.default.clone() {
            Some(directive) if !is_module(&directive.value) => {
                if directive.value != label {
                    let line = &self.files[directive.file].lines[directive.line];
                    let keyword = line.split_whitespace().next().unwrap_or("default");
                    let new = format!("{}{} {}", indent_of(line), keyword, label);
                    self.replace(directive.file, directive.line, new);
                }
            }
            Some(_) => {}
            None => edits.push(Edit::Insert {
                file: 0,
                at: 0,
                text: format!("default {label}"),
            }),
        }

        if module_default || had_markers {
            for (e, entry) in self.entries.iter().enumerate() {
                if e == target {
                    continue;
                }
                if let Some(line) = entry.menu_default_line {
                    edits.push(Edit::Remove {
                        file: entry.file,
                        line,
                    });
                }
            }
            let entry = &self.entries[target];
            if entry.menu_default_line.is_none() {
                edits.push(Edit::Insert {
                    file: entry.file,
                    at: entry.label_line + 1,
                    text: format!("{}menu default", self.body_indent(entry)),
                });
            }
        }
    }

    fn set_timeout(&mut self, edits: &mut Vec<Edit>) {
        match self.timeout {
            Some(i) => {
                let line = &self.files[0].lines[i];
                let mut words = line.split_whitespace();
                let keyword = words.next().unwrap_or("timeout");
                if words.next() != Some("1") {
                    let new = format!("{}{} 1", indent_of(line), keyword);
                    self.replace(0, i, new);
                }
            }
            None => edits.push(Edit::Insert {
                file: 0,
                at: 0,
                text: "timeout 1".to_string(),
            }),
        }
    }

    /// Indentation used by the entry's body lines.
    fn body_indent(&self, entry: &Entry) -> String {
        let lines = &self.files[entry.file].lines;
        if entry.last_line > entry.label_line {
            indent_of(&lines[entry.label_line + 1]).to_string()
        } else {
            format!("{}\t", indent_of(&lines[entry.label_line]))
        }
    }

    fn replace(&mut self, file: usize, line: usize, text: String) {
        let f = &mut self.files[file];
        if f.lines[line] != text {
            f.lines[line] = text;
            f.changed = true;
        }
    }

    /// Apply structural edits bottom-up so recorded line numbers stay valid.
    fn apply(&mut self, mut edits: Vec<Edit>) {
        edits.sort_by_key(|e| std::cmp::Reverse(e.position()));
        for edit in edits {
            match edit {
                Edit::Insert { file, at, text } => {
                    let f = &mut self.files[file];
                    f.lines.insert(at.min(f.lines.len()), text);
                    f.changed = true;
                }
                Edit::Remove { file, line } => {
                    let f = &mut self.files[file];
                    f.lines.remove(line);
                    f.changed = true;
                }
            }
        }
    }

    /// Write back every file that changed; returns their paths.
    pub fn save(&mut self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for file in self.files.iter_mut().filter(|f| f.changed) {
            let mut text = file.lines.join("\n");
            if file.trailing_newline {
                text.push('\n');
            }
            fs::write(&file.path, text)
                .with_context(|| format!("writing boot menu '{}'", file.path.display()))?;
            file.changed = false;
            written.push(file.path.clone());
        }
        Ok(written)
    }
}

/// Minimal isolinux config booting the archive unattended.
pub fn author(archive: &BootArchive) -> String {
    format!(
        "default unattended\n\
         prompt 0\n\
         timeout 1\n\
         \n\
         label unattended\n\
         \tmenu label ^Unattended install\n\
         \tkernel {kernel}\n\
         \tappend initrd={initrd} {params} --- quiet\n",
        kernel = archive.kernel_boot_path(),
        initrd = archive.boot_path(),
        params = UNATTENDED_PARAMS.join(" "),
    )
}

fn is_module(value: &str) -> bool {
    value.to_ascii_lowercase().ends_with(".c32")
}

/// Absolute includes are relative to the image root; relative ones to the
/// including file's directory, then the image root.
fn resolve_include(tree: &Path, including: &Path, target: &str) -> Option<PathBuf> {
    let rel = target.trim_start_matches('/');
    let mut candidates = Vec::new();
    if !target.starts_with('/') {
        if let Some(dir) = including.parent() {
            candidates.push(dir.join(rel));
        }
    }
    candidates.push(tree.join(rel));
    candidates.into_iter().find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::cpio::Compression;
    use crate::layout::ARCHIVE_LAYOUTS;
    use tempfile::TempDir;

    fn archive(tree: &Path) -> BootArchive {
        BootArchive {
            layout: ARCHIVE_LAYOUTS[0],
            path: tree.join("install.amd/initrd.gz"),
            compression: Compression::Gzip,
        }
    }

    fn write(tree: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = tree.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    const SELF_CONTAINED: &str = "\
default rescue
prompt 0
timeout 50

label rescue
  kernel /install.amd/vmlinuz
  append initrd=/install.amd/rescue.gz rescue/enable=true

label install
  menu label ^Install
  kernel /install.amd/vmlinuz
  append vga=788 initrd=/install.amd/initrd.gz --- quiet
";

    #[test]
    fn self_contained_menu_is_patched() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = write(tree, "isolinux/isolinux.cfg", SELF_CONTAINED);

        let mut menu = LegacyMenu::load(tree, &cfg).unwrap();
        assert_eq!(menu.shape(), Shape::SelfContained);
        let label = menu.patch(&archive(tree)).unwrap();
        assert_eq!(label, "install");
        assert_eq!(menu.save().unwrap(), vec![cfg.clone()]);

        let text = fs::read_to_string(&cfg).unwrap();
        assert!(text.contains(
            "  append vga=788 initrd=/install.amd/initrd.gz auto=true priority=critical preseed/file=/preseed.cfg --- quiet\n"
        ));
        assert!(text.contains("append initrd=/install.amd/rescue.gz rescue/enable=true\n"));
        assert!(text.starts_with("default install\n"));
        assert!(text.contains("\ntimeout 1\n"));
        assert!(!text.contains("timeout 50"));
    }

    #[test]
    fn repatching_changes_nothing() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = write(tree, "isolinux/isolinux.cfg", SELF_CONTAINED);

        let mut menu = LegacyMenu::load(tree, &cfg).unwrap();
        menu.patch(&archive(tree)).unwrap();
        menu.save().unwrap();
        let once = fs::read_to_string(&cfg).unwrap();

        let mut again = LegacyMenu::load(tree, &cfg).unwrap();
        again.patch(&archive(tree)).unwrap();
        assert!(again.save().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&cfg).unwrap(), once);
        assert_eq!(once.matches("preseed/file=").count(), 1);
    }

    fn chained_tree(tree: &Path) -> PathBuf {
        write(
            tree,
            "isolinux/menu.cfg",
            "menu hshift 4\ninclude stdmenu.cfg\ninclude gtk.cfg\ninclude txt.cfg\nmenu begin advanced\n    include adtxt.cfg\nmenu end\n",
        );
        write(tree, "isolinux/stdmenu.cfg", "menu background splash.png\ninclude menu.cfg\n");
        write(
            tree,
            "isolinux/gtk.cfg",
            "default installgui\nlabel installgui\n\tmenu label ^Graphical install\n\tmenu default\n\tkernel /install.amd/vmlinuz\n\tappend vga=788 initrd=/install.amd/gtk/initrd.gz --- quiet\n",
        );
        write(
            tree,
            "isolinux/txt.cfg",
            "label install\n\tmenu label ^Install\n\tkernel /install.amd/vmlinuz\n\tappend vga=788 initrd=/install.amd/initrd.gz --- quiet\n",
        );
        write(
            tree,
            "isolinux/adtxt.cfg",
            "label expert\n\tmenu label E^xpert install\n\tkernel /install.amd/vmlinuz\n\tappend priority=low vga=788 initrd=/install.amd/initrd.gz --- \n",
        );
        write(
            tree,
            "isolinux/isolinux.cfg",
            "# D-I config version 2.0\npath \ninclude menu.cfg\ndefault vesamenu.c32\nprompt 0\ntimeout 0\n",
        )
    }

    #[test]
    fn chained_menu_follows_includes_without_looping() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = chained_tree(tree);

        let menu = LegacyMenu::load(tree, &cfg).unwrap();
        let Shape::Chained { included } = menu.shape() else {
            panic!("expected a chained menu");
        };
        let names: Vec<_> = included
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["menu.cfg", "stdmenu.cfg", "gtk.cfg", "txt.cfg", "adtxt.cfg"]);
        let labels: Vec<_> = menu.entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["installgui", "install", "expert"]);
        assert_eq!(menu.default_label(), None);
    }

    #[test]
    fn chained_menu_moves_menu_default_marker() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = chained_tree(tree);

        let mut menu = LegacyMenu::load(tree, &cfg).unwrap();
        assert_eq!(menu.patch(&archive(tree)).unwrap(), "install");
        let changed = menu.save().unwrap();

        let changed_names: Vec<_> = changed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(changed_names, ["isolinux.cfg", "gtk.cfg", "txt.cfg"]);

        let primary = fs::read_to_string(&cfg).unwrap();
        assert!(primary.contains("default vesamenu.c32\n"));
        assert!(primary.contains("timeout 1\n"));

        let gtk = fs::read_to_string(tree.join("isolinux/gtk.cfg")).unwrap();
        assert!(!gtk.contains("menu default"));

        let txt = fs::read_to_string(tree.join("isolinux/txt.cfg")).unwrap();
        assert_eq!(
            txt,
            "label install\n\tmenu default\n\tmenu label ^Install\n\tkernel /install.amd/vmlinuz\n\tappend vga=788 initrd=/install.amd/initrd.gz auto=true priority=critical preseed/file=/preseed.cfg --- quiet\n"
        );

        let adtxt = fs::read_to_string(tree.join("isolinux/adtxt.cfg")).unwrap();
        assert!(adtxt.contains("priority=low"));
    }

    #[test]
    fn chained_repatch_is_stable() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = chained_tree(tree);

        let mut menu = LegacyMenu::load(tree, &cfg).unwrap();
        menu.patch(&archive(tree)).unwrap();
        menu.save().unwrap();

        let mut again = LegacyMenu::load(tree, &cfg).unwrap();
        assert_eq!(again.patch(&archive(tree)).unwrap(), "install");
        assert!(again.save().unwrap().is_empty());
    }

    #[test]
    fn missing_timeout_and_append_are_inserted() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = write(
            tree,
            "isolinux/isolinux.cfg",
            "label install\n  kernel /install.amd/vmlinuz\n",
        );

        let mut menu = LegacyMenu::load(tree, &cfg).unwrap();
        menu.patch(&archive(tree)).unwrap();
        menu.save().unwrap();

        let text = fs::read_to_string(&cfg).unwrap();
        assert!(text.contains("timeout 1\n"));
        assert!(text.contains("default install\n"));
        assert!(text.contains(
            "  kernel /install.amd/vmlinuz\n  append initrd=/install.amd/initrd.gz auto=true priority=critical preseed/file=/preseed.cfg\n"
        ));
    }

    #[test]
    fn empty_menu_is_an_error() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = write(tree, "isolinux/isolinux.cfg", "prompt 0\n");
        let mut menu = LegacyMenu::load(tree, &cfg).unwrap();
        assert!(menu.patch(&archive(tree)).is_err());
    }

    #[test]
    fn authored_config_boots_archive() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        let cfg = write(tree, "isolinux/isolinux.cfg", &author(&archive(tree)));

        let menu = LegacyMenu::load(tree, &cfg).unwrap();
        assert_eq!(menu.default_label(), Some("unattended"));
        assert!(menu.entries()[0].references("install.amd/initrd.gz"));
    }
}
