//! Classic BPF program matching Ethernet frames to or from one hardware
//! address.

use mac_address::MacAddress;

/// Bytes accepted per matching frame.
pub const SNAP_LEN: u32 = 1024;

const BPF_LD_W_ABS: u16 = 0x20;
const BPF_LD_H_ABS: u16 = 0x28;
const BPF_JMP_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

// Ethernet header layout.
const DST_OFFSET: u32 = 0;
const SRC_OFFSET: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    LoadAbsolute { off: u32, size: u8 },
    JumpIfEqual { val: u32, skip_true: u8, skip_false: u8 },
    RetConstant(u32),
}

/// Kernel `sock_filter` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstruction {
    pub op: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Instruction {
    pub fn assemble(&self) -> RawInstruction {
        match *self {
            Instruction::LoadAbsolute { off, size } => RawInstruction {
                op: if size == 2 { BPF_LD_H_ABS } else { BPF_LD_W_ABS },
                jt: 0,
                jf: 0,
                k: off,
            },
            Instruction::JumpIfEqual {
                val,
                skip_true,
                skip_false,
            } => RawInstruction {
                op: BPF_JMP_JEQ_K,
                jt: skip_true,
                jf: skip_false,
                k: val,
            },
            Instruction::RetConstant(val) => RawInstruction {
                op: BPF_RET_K,
                jt: 0,
                jf: 0,
                k: val,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram {
    instructions: Vec<RawInstruction>,
}

impl FilterProgram {
    /// Accepts a frame when either its source or its destination equals
    /// `mac`. Each address is compared as a 32 bit word at `offset + 2`
    /// followed by a 16 bit half word at `offset`.
    pub fn compile(mac: MacAddress) -> Self {
        let bytes = mac.bytes();
        let high = u32::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        let low = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        let instructions = [
            Instruction::LoadAbsolute { off: SRC_OFFSET + 2, size: 4 },
            Instruction::JumpIfEqual { val: low, skip_true: 0, skip_false: 2 },
            Instruction::LoadAbsolute { off: SRC_OFFSET, size: 2 },
            Instruction::JumpIfEqual { val: high, skip_true: 4, skip_false: 0 },
            Instruction::LoadAbsolute { off: DST_OFFSET + 2, size: 4 },
            Instruction::JumpIfEqual { val: low, skip_true: 0, skip_false: 3 },
            Instruction::LoadAbsolute { off: DST_OFFSET, size: 2 },
            Instruction::JumpIfEqual { val: high, skip_true: 0, skip_false: 1 },
            Instruction::RetConstant(SNAP_LEN),
            Instruction::RetConstant(0),
        ];

        FilterProgram {
            instructions: instructions.iter().map(Instruction::assemble).collect(),
        }
    }

    pub fn instructions(&self) -> &[RawInstruction] {
        &self.instructions
    }

    /// Executes the program against a frame and returns the number of bytes
    /// to keep. Zero rejects the frame; so does any out of bounds load.
    pub fn run(&self, frame: &[u8]) -> u32 {
        let mut acc: u32 = 0;
        let mut pc = 0;

        while let Some(ins) = self.instructions.get(pc) {
            match ins.op {
                BPF_LD_W_ABS => match load(frame, ins.k, 4) {
                    Some(v) => acc = v,
                    None => return 0,
                },
                BPF_LD_H_ABS => match load(frame, ins.k, 2) {
                    Some(v) => acc = v,
                    None => return 0,
                },
                BPF_JMP_JEQ_K => {
                    let skip = if acc == ins.k { ins.jt } else { ins.jf };
                    pc += usize::from(skip);
                }
                BPF_RET_K => return ins.k,
                _ => return 0,
            }
            pc += 1;
        }

        0
    }

    pub fn matches(&self, frame: &[u8]) -> bool {
        self.run(frame) > 0
    }
}

fn load(frame: &[u8], off: u32, size: usize) -> Option<u32> {
    let start = usize::try_from(off).ok()?;
    let bytes = frame.get(start..start.checked_add(size)?)?;

    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}
