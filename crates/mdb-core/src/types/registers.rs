//! # Register State
//!
//! Thread register layouts for the two x86 flavors a Mach thread can report.
//!
//! The kernel moves thread state as an array of `natural_t` (32-bit) words:
//!
//! - **`x86_THREAD_STATE64`** (flavor 4): 21 registers of 64 bits, 42 words,
//!   each register stored low word first
//! - **`x86_THREAD_STATE32`** (flavor 1): 16 registers of 32 bits, 16 words
//!
//! Register order matches `<mach/i386/_structs.h>`.
//!
//! ## References
//!
//! - [`_STRUCT_X86_THREAD_STATE64`](https://opensource.apple.com/source/xnu/xnu-4570.71.2/osfmk/mach/i386/_structs.h)

use std::collections::BTreeMap;
use std::fmt;

/// Register width a thread has been pinned to.
///
/// Transitions only from `Unknown` to `Narrow` or `Wide`; never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadArchitecture
{
    /// Not probed yet
    #[default]
    Unknown,
    /// 32-bit x86 (`x86_THREAD_STATE32`)
    Narrow,
    /// x86-64 (`x86_THREAD_STATE64`)
    Wide,
}

impl fmt::Display for ThreadArchitecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ThreadArchitecture::Unknown => write!(f, "unknown"),
            ThreadArchitecture::Narrow => write!(f, "i386"),
            ThreadArchitecture::Wide => write!(f, "x86_64"),
        }
    }
}

/// A register layout that can be moved through `thread_get_state` / `thread_set_state`.
pub trait ThreadStateFlavor: Sized
{
    /// Kernel flavor tag.
    const FLAVOR: i32;
    /// State size in `natural_t` words.
    const WORD_COUNT: usize;
    /// Architecture this flavor pins a thread to.
    const ARCHITECTURE: ThreadArchitecture;
    /// Register names in kernel order.
    const NAMES: &'static [&'static str];

    /// Decode from kernel words. Missing words read as zero.
    fn from_words(words: &[u32]) -> Self;

    /// Encode to exactly [`Self::WORD_COUNT`] words.
    fn to_words(&self) -> Vec<u32>;

    fn get(&self, name: &str) -> Option<u64>;

    /// Overwrite a register by name.
    ///
    /// Returns `Ok(false)` for an unknown name and `Err(value)` when the value
    /// does not fit the register width.
    fn set(&mut self, name: &str, value: u64) -> Result<bool, u64>;

    /// `(name, value)` pairs in kernel order.
    fn registers(&self) -> Vec<(&'static str, u64)>;
}

/// Register storage width, used by the layout macro.
trait RegisterWord: Copy + Default
{
    const WORDS: usize;

    fn read(words: &[u32]) -> Self;
    fn write(self, out: &mut Vec<u32>);
    fn widen(self) -> u64;
    fn narrow(value: u64) -> Option<Self>;
}

impl RegisterWord for u64
{
    const WORDS: usize = 2;

    fn read(words: &[u32]) -> Self
    {
        let lo = u64::from(words.first().copied().unwrap_or(0));
        let hi = u64::from(words.get(1).copied().unwrap_or(0));
        lo | (hi << 32)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(self, out: &mut Vec<u32>)
    {
        out.push(self as u32);
        out.push((self >> 32) as u32);
    }

    fn widen(self) -> u64
    {
        self
    }

    fn narrow(value: u64) -> Option<Self>
    {
        Some(value)
    }
}

impl RegisterWord for u32
{
    const WORDS: usize = 1;

    fn read(words: &[u32]) -> Self
    {
        words.first().copied().unwrap_or(0)
    }

    fn write(self, out: &mut Vec<u32>)
    {
        out.push(self);
    }

    fn widen(self) -> u64
    {
        u64::from(self)
    }

    fn narrow(value: u64) -> Option<Self>
    {
        u32::try_from(value).ok()
    }
}

macro_rules! thread_state {
    (
        $(#[$meta:meta])*
        $name:ident($word:ty, flavor = $flavor:expr, arch = $arch:ident) { $($reg:ident),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name
        {
            $(pub $reg: $word,)+
        }

        impl ThreadStateFlavor for $name
        {
            const FLAVOR: i32 = $flavor;
            const WORD_COUNT: usize = Self::NAMES.len() * <$word as RegisterWord>::WORDS;
            const ARCHITECTURE: ThreadArchitecture = ThreadArchitecture::$arch;
            const NAMES: &'static [&'static str] = &[$(stringify!($reg)),+];

            fn from_words(words: &[u32]) -> Self
            {
                let mut chunks = words.chunks(<$word as RegisterWord>::WORDS);
                let mut state = Self::default();
                $(state.$reg = chunks.next().map(<$word as RegisterWord>::read).unwrap_or_default();)+
                state
            }

            fn to_words(&self) -> Vec<u32>
            {
                let mut words = Vec::with_capacity(Self::WORD_COUNT);
                $(RegisterWord::write(self.$reg, &mut words);)+
                words
            }

            fn get(&self, name: &str) -> Option<u64>
            {
                match name {
                    $(stringify!($reg) => Some(RegisterWord::widen(self.$reg)),)+
                    _ => None,
                }
            }

            fn set(&mut self, name: &str, value: u64) -> Result<bool, u64>
            {
                match name {
                    $(stringify!($reg) => {
                        self.$reg = <$word as RegisterWord>::narrow(value).ok_or(value)?;
                        Ok(true)
                    })+
                    _ => Ok(false),
                }
            }

            fn registers(&self) -> Vec<(&'static str, u64)>
            {
                vec![$((stringify!($reg), RegisterWord::widen(self.$reg))),+]
            }
        }
    };
}

thread_state! {
    /// `x86_thread_state64_t`: general purpose, instruction pointer, flags and segment registers.
    X86ThreadState64(u64, flavor = 4, arch = Wide) {
        rax, rbx, rcx, rdx, rdi, rsi, rbp, rsp,
        r8, r9, r10, r11, r12, r13, r14, r15,
        rip, rflags, cs, fs, gs,
    }
}

thread_state! {
    /// `x86_thread_state32_t`.
    X86ThreadState32(u32, flavor = 1, arch = Narrow) {
        eax, ebx, ecx, edx, edi, esi, ebp, esp,
        ss, eflags, eip, cs, ds, es, fs, gs,
    }
}

/// Register values of one thread, shaped by its pinned architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState
{
    Wide(X86ThreadState64),
    Narrow(X86ThreadState32),
}

impl RegisterState
{
    #[must_use]
    pub const fn architecture(&self) -> ThreadArchitecture
    {
        match self {
            RegisterState::Wide(_) => ThreadArchitecture::Wide,
            RegisterState::Narrow(_) => ThreadArchitecture::Narrow,
        }
    }

    /// Look up a register by name (`"rip"`, `"eax"`, ...).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64>
    {
        match self {
            RegisterState::Wide(state) => state.get(name),
            RegisterState::Narrow(state) => state.get(name),
        }
    }

    /// `(name, value)` pairs in kernel order.
    #[must_use]
    pub fn registers(&self) -> Vec<(&'static str, u64)>
    {
        match self {
            RegisterState::Wide(state) => state.registers(),
            RegisterState::Narrow(state) => state.registers(),
        }
    }

    /// Name to value mapping.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<&'static str, u64>
    {
        self.registers().into_iter().collect()
    }

    /// Instruction pointer (`rip` or `eip`).
    #[must_use]
    pub fn instruction_pointer(&self) -> u64
    {
        match self {
            RegisterState::Wide(state) => state.rip,
            RegisterState::Narrow(state) => u64::from(state.eip),
        }
    }

    /// Stack pointer (`rsp` or `esp`).
    #[must_use]
    pub fn stack_pointer(&self) -> u64
    {
        match self {
            RegisterState::Wide(state) => state.rsp,
            RegisterState::Narrow(state) => u64::from(state.esp),
        }
    }
}

impl fmt::Display for RegisterState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let width = match self {
            RegisterState::Wide(_) => 16,
            RegisterState::Narrow(_) => 8,
        };
        for (index, (name, value)) in self.registers().into_iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{name:>6} = 0x{value:0width$x}")?;
        }
        Ok(())
    }
}
