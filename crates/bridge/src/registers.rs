//! x86-64 register file as exchanged with the tracing facility.

/// Mirror of the kernel's `struct reg` for amd64.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub trapno: u32,
    pub fs: u16,
    pub gs: u16,
    pub err: u32,
    pub es: u16,
    pub ds: u16,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Maximum number of register-passed arguments.
pub const MAX_ARGS: usize = 6;

impl Registers {
    /// Place function arguments per the SysV calling convention.
    pub fn set_call_args(&mut self, args: &[u64]) {
        let slots = [
            &mut self.rdi,
            &mut self.rsi,
            &mut self.rdx,
            &mut self.rcx,
            &mut self.r8,
            &mut self.r9,
        ];
        for (slot, value) in slots.into_iter().zip(args.iter().chain(std::iter::repeat(&0))) {
            *slot = *value;
        }
    }

    /// Place syscall arguments; the kernel takes the fourth in r10.
    pub fn set_syscall_args(&mut self, sysno: i64, args: &[u64]) {
        self.rax = sysno as u64;
        let slots = [
            &mut self.rdi,
            &mut self.rsi,
            &mut self.rdx,
            &mut self.r10,
            &mut self.r8,
            &mut self.r9,
        ];
        for (slot, value) in slots.into_iter().zip(args.iter().chain(std::iter::repeat(&0))) {
            *slot = *value;
        }
    }

    /// Function arguments, in calling-convention order.
    pub fn call_args(&self) -> [u64; MAX_ARGS] {
        [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }

    /// Syscall arguments, in kernel order.
    pub fn syscall_args(&self) -> [u64; MAX_ARGS] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    pub fn return_value(&self) -> u64 {
        self.rax
    }
}
