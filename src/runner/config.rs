//! Engine configuration.

use std::fmt;
use std::str::FromStr;

pub use crate::runner::ds::heap::HeapConfig;

/// Calling convention and register file the JIT generates code for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    X86,
    X86_64SysV,
    X86_64Win64,
    Arm,
}

impl TargetKind {
    pub const ALL: [TargetKind; 4] = [
        TargetKind::X86,
        TargetKind::X86_64SysV,
        TargetKind::X86_64Win64,
        TargetKind::Arm,
    ];

    /// Target matching the machine the crate was built for. Falls back to
    /// x86-64 SysV on anything else.
    pub fn host() -> TargetKind {
        if cfg!(target_arch = "x86") {
            TargetKind::X86
        } else if cfg!(all(target_arch = "x86_64", windows)) {
            TargetKind::X86_64Win64
        } else if cfg!(target_arch = "arm") {
            TargetKind::Arm
        } else {
            TargetKind::X86_64SysV
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetKind::X86 => "x86",
            TargetKind::X86_64SysV => "x86-64",
            TargetKind::X86_64Win64 => "win64",
            TargetKind::Arm => "arm",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86" | "i386" => Ok(TargetKind::X86),
            "x86-64" | "x86_64" | "sysv" => Ok(TargetKind::X86_64SysV),
            "win64" => Ok(TargetKind::X86_64Win64),
            "arm" | "armv7" => Ok(TargetKind::Arm),
            _ => Err(format!("unknown target '{}'", s)),
        }
    }
}

/// Which instruction selection turns IR into runnable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Bytecode plus interpreter.
    Interpreter,
    /// Machine code for the given target, run on the built-in simulator.
    Jit(TargetKind),
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Interpreter
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: Backend,
    pub heap: HeapConfig,
    pub max_call_depth: u32,
    /// Host stack, in bytes, that nested calls may use below the outermost
    /// one. Exceeding it is a RangeError, like exceeding `max_call_depth`.
    pub max_native_stack: usize,
    pub use_fast_lookups: bool,
    pub executable_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            backend: Backend::Interpreter,
            heap: HeapConfig::unlimited(),
            max_call_depth: 512,
            max_native_stack: 1 << 20,
            use_fast_lookups: true,
            executable_page_size: 4096,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        EngineConfig::default()
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_heap(mut self, heap: HeapConfig) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_max_call_depth(mut self, depth: u32) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_native_stack(mut self, bytes: usize) -> Self {
        self.max_native_stack = bytes;
        self
    }

    pub fn with_fast_lookups(mut self, on: bool) -> Self {
        self.use_fast_lookups = on;
        self
    }

    pub fn with_executable_page_size(mut self, size: usize) -> Self {
        self.executable_page_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_names_parse_back() {
        for t in TargetKind::ALL {
            assert_eq!(t.name().parse::<TargetKind>(), Ok(t));
        }
        assert!("sparc".parse::<TargetKind>().is_err());
    }

    #[test]
    fn test_builder() {
        let c = EngineConfig::new()
            .with_backend(Backend::Jit(TargetKind::Arm))
            .with_heap(HeapConfig::with_limit(10))
            .with_fast_lookups(false);
        assert_eq!(c.backend, Backend::Jit(TargetKind::Arm));
        assert_eq!(c.heap.max_objects, Some(10));
        assert!(!c.use_fast_lookups);
        assert_eq!(c.max_call_depth, 512);
        assert_eq!(c.max_native_stack, 1 << 20);
        assert_eq!(c.with_max_native_stack(4096).max_native_stack, 4096);
    }
}
