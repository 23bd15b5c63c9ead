//! Link-mode configuration. These values arrive from the driving linker's command line; the
//! numeric thresholds are architecture constants that callers can override but normally leave at
//! their defaults.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    StaticExecutable(RelocationModel),
    DynamicExecutable(RelocationModel),
    SharedObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationModel {
    NonRelocatable,
    Relocatable,
}

impl OutputKind {
    #[must_use]
    pub fn is_executable(self) -> bool {
        !matches!(self, OutputKind::SharedObject)
    }

    #[must_use]
    pub fn is_static_executable(self) -> bool {
        matches!(self, OutputKind::StaticExecutable(_))
    }

    /// Whether the output can be loaded at an arbitrary address, requiring RELATIVE dynamic
    /// relocations for addresses baked into data.
    #[must_use]
    pub fn is_relocatable(self) -> bool {
        !matches!(
            self,
            OutputKind::StaticExecutable(RelocationModel::NonRelocatable)
                | OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)
        )
    }

    #[must_use]
    pub fn is_shared_object(self) -> bool {
        matches!(self, OutputKind::SharedObject)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub output_kind: OutputKind,

    /// True when producing a relocatable object (`-r`). Relocations pass through untouched, so
    /// TLS sequences must not be rewritten.
    pub relocatable_output: bool,

    /// Maximum total code size covered by one stub group. `None` selects the architecture
    /// default: the 128 MiB branch reach less 1 MiB of headroom.
    pub stub_group_size: Option<u64>,

    /// Whether sections following a full stub group may still use its stubs via backward
    /// branches.
    pub stubs_after_branch: bool,

    pub fix_erratum_835769: bool,
    pub fix_erratum_843419: bool,

    /// Prefer rewriting the erratum-843419 ADRP to a position-independent ADR when the
    /// displacement fits, rather than always branching to a veneer.
    pub fix_erratum_843419_adr: bool,

    /// Whether TLS access sequences may be rewritten to cheaper models.
    pub relax: bool,
}

impl Config {
    #[must_use]
    pub fn new(output_kind: OutputKind) -> Self {
        Self {
            output_kind,
            relocatable_output: false,
            stub_group_size: None,
            stubs_after_branch: true,
            fix_erratum_835769: false,
            fix_erratum_843419: false,
            fix_erratum_843419_adr: true,
            relax: true,
        }
    }

    /// TLS relaxation only applies to a final executable link. Everything else, including
    /// relocatable output, passes TLS relocations through unchanged.
    #[must_use]
    pub(crate) fn tls_relaxation_applies(&self) -> bool {
        self.relax && !self.relocatable_output && self.output_kind.is_executable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_kind_predicates() {
        let static_exe = OutputKind::StaticExecutable(RelocationModel::NonRelocatable);
        assert!(static_exe.is_executable());
        assert!(static_exe.is_static_executable());
        assert!(!static_exe.is_relocatable());

        let pie = OutputKind::DynamicExecutable(RelocationModel::Relocatable);
        assert!(pie.is_executable());
        assert!(pie.is_relocatable());

        assert!(OutputKind::SharedObject.is_relocatable());
        assert!(!OutputKind::SharedObject.is_executable());
    }

    #[test]
    fn relaxation_mode_gating() {
        let mut config = Config::new(OutputKind::StaticExecutable(RelocationModel::NonRelocatable));
        assert!(config.tls_relaxation_applies());
        config.relocatable_output = true;
        assert!(!config.tls_relaxation_applies());

        let shared = Config::new(OutputKind::SharedObject);
        assert!(!shared.tls_relaxation_applies());
    }
}
