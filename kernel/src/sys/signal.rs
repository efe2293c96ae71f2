//! Signals
//!
//! Standard signal numbers and their default dispositions. Signals are only
//! queued when sent; the process manager applies them at the next scheduling
//! decision point.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Signal number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Signal {
    /// Hangup
    Hup = 1,
    /// Interrupt
    Int = 2,
    /// Quit
    Quit = 3,
    /// Illegal instruction
    Ill = 4,
    /// Trace trap
    Trap = 5,
    /// Abort
    Abrt = 6,
    /// Bus error
    Bus = 7,
    /// Floating point exception
    Fpe = 8,
    /// Kill (cannot be blocked)
    Kill = 9,
    /// User defined 1
    Usr1 = 10,
    /// Segmentation violation
    Segv = 11,
    /// User defined 2
    Usr2 = 12,
    /// Broken pipe
    Pipe = 13,
    /// Alarm clock
    Alrm = 14,
    /// Termination request
    Term = 15,
    /// Stack fault
    Stkflt = 16,
    /// Child stopped or terminated
    Chld = 17,
    /// Continue if stopped
    Cont = 18,
    /// Stop (cannot be blocked)
    Stop = 19,
    /// Terminal stop
    Tstp = 20,
    /// Background read from terminal
    Ttin = 21,
    /// Background write to terminal
    Ttou = 22,
}

/// What happens when a signal is delivered with no handler installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Terminate with exit code 128 + signo
    Terminate,
    /// Terminate as a core dump (same exit code in this model)
    CoreDump,
    /// Stop the process
    Stop,
    /// Resume a stopped process
    Continue,
    /// Discard
    Ignore,
}

impl Signal {
    /// Every signal in numeric order
    pub const ALL: [Signal; 22] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Ill,
        Signal::Trap,
        Signal::Abrt,
        Signal::Bus,
        Signal::Fpe,
        Signal::Kill,
        Signal::Usr1,
        Signal::Segv,
        Signal::Usr2,
        Signal::Pipe,
        Signal::Alrm,
        Signal::Term,
        Signal::Stkflt,
        Signal::Chld,
        Signal::Cont,
        Signal::Stop,
        Signal::Tstp,
        Signal::Ttin,
        Signal::Ttou,
    ];

    /// Signal number
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Signal from its number
    pub fn from_number(signo: u8) -> Option<Signal> {
        Self::ALL.get((signo as usize).checked_sub(1)?).copied()
    }

    /// Default disposition
    pub fn disposition(self) -> Disposition {
        match self {
            Signal::Quit
            | Signal::Ill
            | Signal::Trap
            | Signal::Abrt
            | Signal::Bus
            | Signal::Fpe
            | Signal::Segv
            | Signal::Stkflt => Disposition::CoreDump,
            Signal::Stop | Signal::Tstp | Signal::Ttin | Signal::Ttou => Disposition::Stop,
            Signal::Cont => Disposition::Continue,
            Signal::Chld => Disposition::Ignore,
            _ => Disposition::Terminate,
        }
    }

    /// Exit code of a process killed by this signal
    pub fn exit_code(self) -> i32 {
        128 + self.number() as i32
    }

    /// Conventional name, e.g. `SIGTERM`
    pub fn name(self) -> String {
        format!("SIG{}", format!("{:?}", self).to_uppercase())
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(signo) = s.parse::<u8>() {
            return Signal::from_number(signo).ok_or_else(|| format!("Unknown signal: {}", s));
        }
        let upper = s.to_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        Signal::ALL
            .iter()
            .copied()
            .find(|sig| format!("{:?}", sig).to_uppercase() == bare)
            .ok_or_else(|| format!("Unknown signal: {}", s))
    }
}

bitflags! {
    /// Set of signals, bit n for signal number n
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SignalSet: u32 {
        /// SIGHUP
        const HUP = 1 << 1;
        /// SIGINT
        const INT = 1 << 2;
        /// SIGQUIT
        const QUIT = 1 << 3;
        /// SIGILL
        const ILL = 1 << 4;
        /// SIGTRAP
        const TRAP = 1 << 5;
        /// SIGABRT
        const ABRT = 1 << 6;
        /// SIGBUS
        const BUS = 1 << 7;
        /// SIGFPE
        const FPE = 1 << 8;
        /// SIGKILL
        const KILL = 1 << 9;
        /// SIGUSR1
        const USR1 = 1 << 10;
        /// SIGSEGV
        const SEGV = 1 << 11;
        /// SIGUSR2
        const USR2 = 1 << 12;
        /// SIGPIPE
        const PIPE = 1 << 13;
        /// SIGALRM
        const ALRM = 1 << 14;
        /// SIGTERM
        const TERM = 1 << 15;
        /// SIGSTKFLT
        const STKFLT = 1 << 16;
        /// SIGCHLD
        const CHLD = 1 << 17;
        /// SIGCONT
        const CONT = 1 << 18;
        /// SIGSTOP
        const STOP = 1 << 19;
        /// SIGTSTP
        const TSTP = 1 << 20;
        /// SIGTTIN
        const TTIN = 1 << 21;
        /// SIGTTOU
        const TTOU = 1 << 22;
    }
}

impl SignalSet {
    /// Signals no mask can block
    pub const UNBLOCKABLE: Self = Self::KILL.union(Self::STOP);

    /// Set holding one signal
    pub fn of(signal: Signal) -> Self {
        Self::from_bits_retain(1 << signal.number())
    }

    /// Check membership
    pub fn has(self, signal: Signal) -> bool {
        self.contains(Self::of(signal))
    }

    /// Signals in the set, lowest number first
    pub fn signals(self) -> impl Iterator<Item = Signal> {
        Signal::ALL.into_iter().filter(move |&sig| self.has(sig))
    }
}

impl From<Signal> for SignalSet {
    fn from(signal: Signal) -> Self {
        Self::of(signal)
    }
}
