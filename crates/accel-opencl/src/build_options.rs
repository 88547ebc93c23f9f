//! Order-independent compiler option sets.
//!
//! [`BuildOptions`] is a deduplicated set of OpenCL compiler flags. Its
//! canonical string is part of the compiled-program cache key, so two sets
//! with the same content always canonicalize identically regardless of
//! insertion order: options are emitted in sorted order.

use std::collections::BTreeSet;
use std::fmt;

/// A set of compiler flags such as `-DDATA_TYPE=float`.
///
/// Options are stored verbatim; callers pre-format them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    options: BTreeSet<String>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, option: impl Into<String>) {
        self.options.insert(option.into());
    }

    pub fn add_if(&mut self, cond: bool, option: impl Into<String>) {
        if cond {
            self.add(option);
        }
    }

    pub fn add_if_else(&mut self, cond: bool, if_true: impl Into<String>, if_false: impl Into<String>) {
        if cond {
            self.add(if_true);
        } else {
            self.add(if_false);
        }
    }

    pub fn add_all(&mut self, other: &Self) {
        self.options.extend(other.options.iter().cloned());
    }

    pub fn contains(&self, option: &str) -> bool {
        self.options.contains(option)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    /// Space-separated options in sorted order, prefixed by `-I<path>` when
    /// an include path is given.
    pub fn canonical_string(&self, include_path: Option<&str>) -> String {
        let include = include_path.filter(|p| !p.is_empty()).map(|p| format!("-I{p}"));
        include
            .into_iter()
            .chain(self.options.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string(None))
    }
}

impl<S: Into<String>> FromIterator<S> for BuildOptions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self { options: iter.into_iter().map(Into::into).collect() }
    }
}

impl<S: Into<String>> Extend<S> for BuildOptions {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.options.extend(iter.into_iter().map(Into::into));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutations_canonicalize_identically() {
        let a: BuildOptions = ["-DFOO=1", "-DBAR=2"].into_iter().collect();
        let b: BuildOptions = ["-DBAR=2", "-DFOO=1"].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.canonical_string(None), "-DBAR=2 -DFOO=1");
        assert_eq!(a.canonical_string(None), b.canonical_string(None));
    }

    #[test]
    fn duplicates_coalesce() {
        let mut opts = BuildOptions::new();
        opts.add("-DX");
        opts.add("-DX");
        assert_eq!(opts.len(), 1);
    }

    #[test]
    fn conditional_insertion() {
        let mut opts = BuildOptions::new();
        opts.add_if(false, "-DNEVER");
        opts.add_if(true, "-DALWAYS");
        opts.add_if_else(false, "-DYES", "-DNO");
        assert!(!opts.contains("-DNEVER"));
        assert!(opts.contains("-DALWAYS"));
        assert!(opts.contains("-DNO"));
        assert!(!opts.contains("-DYES"));
    }

    #[test]
    fn include_path_comes_first() {
        let opts: BuildOptions = ["-DA"].into_iter().collect();
        assert_eq!(opts.canonical_string(Some("/kernels")), "-I/kernels -DA");
        assert_eq!(opts.canonical_string(Some("")), "-DA");
        assert_eq!(BuildOptions::new().canonical_string(None), "");
    }

    #[test]
    fn add_all_merges() {
        let mut a: BuildOptions = ["-DA"].into_iter().collect();
        let b: BuildOptions = ["-DB", "-DA"].into_iter().collect();
        a.add_all(&b);
        assert_eq!(a.to_string(), "-DA -DB");
    }
}
