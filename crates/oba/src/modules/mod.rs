//! Bundled core modules, embedded as source text and loaded on demand
//! through the import mechanism.

/// The privileged module that populates the VM-wide globals table. Loaded
/// once at VM creation; the `__native_global` native refuses every other
/// caller.
pub const GLOBALS_MODULE: &str = "__globals__";

static CORE_MODULES: &[(&str, &str)] = &[
    ("list", include_str!("list.oba")),
    ("option", include_str!("option.oba")),
    ("strings", include_str!("strings.oba")),
    ("system", include_str!("system.oba")),
    ("time", include_str!("time.oba")),
    (GLOBALS_MODULE, include_str!("globals.oba")),
];

/// The bundled source for `name`, if it is a core module.
#[must_use]
pub fn core_module_source(name: &str) -> Option<&'static str> {
    CORE_MODULES
        .iter()
        .find(|(module, _)| *module == name)
        .map(|(_, source)| *source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_modules_are_bundled() {
        for name in ["list", "option", "strings", "system", "time", GLOBALS_MODULE] {
            assert!(core_module_source(name).is_some(), "missing module {name}");
        }
        assert!(core_module_source("missing").is_none());
    }
}
