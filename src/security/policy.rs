use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Modules no allow-list may ever name, nor any submodule of them.
pub const FORBIDDEN_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "pathlib",
    "importlib",
    "ctypes",
    "multiprocessing",
    "threading",
    "signal",
    "builtins",
    "pickle",
    "marshal",
    "shelve",
    "code",
    "codeop",
    "inspect",
    "gc",
    "resource",
    "pty",
    "fcntl",
    "urllib",
    "http",
    "ftplib",
    "asyncio",
    "select",
    "selectors",
    "tempfile",
    "glob",
    "sqlite3",
    "webbrowser",
    "requests",
];

pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "math",
    "statistics",
    "random",
    "decimal",
    "fractions",
    "datetime",
    "time",
    "json",
    "csv",
    "re",
    "string",
    "textwrap",
    "collections",
    "itertools",
    "functools",
    "operator",
    "numpy",
    "pandas",
    "matplotlib",
    "seaborn",
];

/// Modules a snippet may import without an allow-list entry, cut down to
/// the listed members.
pub const NARROWED_MODULES: &[(&str, &[&str])] = &[("io", &["StringIO", "BytesIO"])];

/// Members of importable modules a snippet can never reach. A trailing `*`
/// matches by prefix.
pub const HIDDEN_MEMBERS: &[(&str, &[&str])] = &[
    ("operator", &["attrgetter", "methodcaller"]),
    (
        "numpy",
        &["ctypeslib", "f2py", "distutils", "testing", "lib", "memmap", "DataSource", "load"],
    ),
    (
        "pandas",
        &["io", "HDFStore", "read_pickle", "to_pickle", "read_hdf", "read_sql*", "read_clipboard"],
    ),
    ("matplotlib", &["rc_file"]),
    ("seaborn", &["load_dataset", "get_dataset_names", "get_data_home"]),
];

/// Readers and writers that only take in-memory buffers; a path, a file
/// descriptor or a URL is refused.
pub const BUFFER_ONLY_MEMBERS: &[(&str, &[&str])] = &[
    (
        "numpy",
        &["loadtxt", "genfromtxt", "fromfile", "fromregex", "save", "savez", "savez_compressed", "savetxt"],
    ),
    ("pandas", &["read_*", "ExcelWriter"]),
    ("matplotlib.pyplot", &["savefig", "imread", "imsave"]),
    ("matplotlib.image", &["imread", "imsave"]),
];

/// Builtins a snippet can see. Anything missing here simply does not exist
/// inside the worker.
pub const ALLOWED_BUILTINS: &[&str] = &[
    "abs",
    "all",
    "any",
    "ascii",
    "bin",
    "bool",
    "bytearray",
    "bytes",
    "callable",
    "chr",
    "classmethod",
    "complex",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "hasattr",
    "hash",
    "hex",
    "id",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "map",
    "max",
    "min",
    "next",
    "object",
    "oct",
    "ord",
    "pow",
    "print",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "slice",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "zip",
    "__build_class__",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "BaseException",
    "Exception",
    "IndexError",
    "KeyError",
    "LookupError",
    "NameError",
    "NotImplementedError",
    "OverflowError",
    "RuntimeError",
    "StopIteration",
    "TypeError",
    "ValueError",
    "ZeroDivisionError",
    "True",
    "False",
    "None",
    "NotImplemented",
    "Ellipsis",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("allow-list entry '{0}' is not a dotted module name")]
    Malformed(String),
    #[error("allow-list entry '{0}' names a forbidden module")]
    Forbidden(String),
    #[error("module allow-list is empty")]
    Empty,
}

/// Validated capability allow-list. Construction is the only fallible step;
/// configuring a runtime from it cannot fail.
#[derive(Debug, Clone)]
pub struct CapabilityPolicy {
    allowed_modules: BTreeSet<String>,
}

impl CapabilityPolicy {
    pub fn new<I, S>(allowed_modules: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut modules = BTreeSet::new();
        for entry in allowed_modules {
            let entry = entry.as_ref().trim();
            if !is_dotted_name(entry) {
                return Err(PolicyError::Malformed(entry.to_string()));
            }
            if FORBIDDEN_MODULES.iter().any(|f| module_matches(entry, f)) {
                return Err(PolicyError::Forbidden(entry.to_string()));
            }
            modules.insert(entry.to_string());
        }
        if modules.is_empty() {
            return Err(PolicyError::Empty);
        }
        Ok(Self {
            allowed_modules: modules,
        })
    }

    /// Install the allow-list into a runtime descriptor for one execution.
    pub fn configure(&self) -> RestrictedRuntime {
        RestrictedRuntime {
            allowed_modules: self.allowed_modules.clone(),
            allowed_builtins: ALLOWED_BUILTINS.iter().map(|s| s.to_string()).collect(),
            narrowed_modules: member_table(NARROWED_MODULES),
            hidden_members: member_table(HIDDEN_MEMBERS),
            buffer_only_members: member_table(BUFFER_ONLY_MEMBERS),
        }
    }

    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// What a single worker is allowed to reach. Handed to the worker verbatim
/// and consulted by the static scan.
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictedRuntime {
    pub allowed_modules: BTreeSet<String>,
    pub allowed_builtins: BTreeSet<String>,
    pub narrowed_modules: BTreeMap<String, BTreeSet<String>>,
    pub hidden_members: BTreeMap<String, BTreeSet<String>>,
    pub buffer_only_members: BTreeMap<String, BTreeSet<String>>,
}

impl RestrictedRuntime {
    pub fn module_allowed(&self, name: &str) -> bool {
        self.narrowed_modules.contains_key(name)
            || self
                .allowed_modules
                .iter()
                .any(|allowed| module_matches(name, allowed))
    }

    /// Whether `module.member` is reachable from a snippet at all. Private
    /// names never are.
    pub fn member_visible(&self, module: &str, member: &str) -> bool {
        if member.starts_with('_') {
            return false;
        }
        if let Some(surface) = self.narrowed_modules.get(module) {
            if !surface.contains(member) {
                return false;
            }
        }
        !self
            .hidden_members
            .get(module)
            .is_some_and(|hidden| hidden.iter().any(|p| member_matches(member, p)))
    }
}

fn member_table(table: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
    table
        .iter()
        .map(|(module, members)| {
            (
                module.to_string(),
                members.iter().map(|m| m.to_string()).collect(),
            )
        })
        .collect()
}

/// `pattern` is an exact member name or a `prefix*`.
fn member_matches(member: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => member.starts_with(prefix),
        None => member == pattern,
    }
}

/// `name` is `base` itself or one of its submodules.
fn module_matches(name: &str, base: &str) -> bool {
    name == base
        || name
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn is_dotted_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
