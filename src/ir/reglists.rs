//! Use/def lists for virtual registers.
//!
//! Every register operand naming a virtual register has a record in an arena. The records for one
//! register form a doubly linked list through arena indices. Defs are linked at the head of the
//! list and uses at the tail, so a walk from the head always sees every def before any use.

use crate::entity::packed_option::PackedOption;
use crate::entity::{entity_impl, PrimaryMap, SecondaryMap};
use crate::ir::{Inst, VirtReg};

/// A handle to one register operand record.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegOperand(u32);
entity_impl!(RegOperand, "regop");

/// The position of an operand: instruction and operand index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperandRef {
    /// The instruction.
    pub inst: Inst,
    /// Index into the instruction's operand list.
    pub index: usize,
}

#[derive(Clone, Debug)]
struct Record {
    reg: VirtReg,
    inst: Inst,
    index: u32,
    is_def: bool,
    live: bool,
    prev: PackedOption<RegOperand>,
    next: PackedOption<RegOperand>,
}

#[derive(Clone, Debug, Default)]
struct ListHead {
    first: PackedOption<RegOperand>,
    last: PackedOption<RegOperand>,
    len: u32,
}

/// Use/def lists for all virtual registers of a function.
#[derive(Clone, Debug, Default)]
pub struct RegOperandLists {
    records: PrimaryMap<RegOperand, Record>,
    free: Vec<RegOperand>,
    heads: SecondaryMap<VirtReg, ListHead>,
}

impl RegOperandLists {
    /// Create empty lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all lists.
    pub fn clear(&mut self) {
        self.records.clear();
        self.free.clear();
        self.heads.clear();
    }

    /// Add a record for operand `index` of `inst` reading or writing `reg`.
    pub fn link(&mut self, reg: VirtReg, inst: Inst, index: usize, is_def: bool) -> RegOperand {
        let rec = Record {
            reg,
            inst,
            index: index as u32,
            is_def,
            live: true,
            prev: None.into(),
            next: None.into(),
        };
        let handle = match self.free.pop() {
            Some(h) => {
                self.records[h] = rec;
                h
            }
            None => self.records.push(rec),
        };

        let head = &mut self.heads[reg];
        head.len += 1;
        if is_def {
            // Defs go to the front.
            let old_first = head.first;
            head.first = handle.into();
            if head.last.is_none() {
                head.last = handle.into();
            }
            self.records[handle].next = old_first;
            if let Some(f) = old_first.expand() {
                self.records[f].prev = handle.into();
            }
        } else {
            // Uses go to the back.
            let old_last = head.last;
            head.last = handle.into();
            if head.first.is_none() {
                head.first = handle.into();
            }
            self.records[handle].prev = old_last;
            if let Some(l) = old_last.expand() {
                self.records[l].next = handle.into();
            }
        }
        handle
    }

    /// Remove a record from its list and recycle it.
    pub fn unlink(&mut self, handle: RegOperand) {
        let (reg, prev, next) = {
            let r = &mut self.records[handle];
            debug_assert!(r.live, "{handle} unlinked twice");
            r.live = false;
            (r.reg, r.prev, r.next)
        };
        let head = &mut self.heads[reg];
        head.len -= 1;
        match prev.expand() {
            None => head.first = next,
            Some(p) => self.records[p].next = next,
        }
        match next.expand() {
            None => self.heads[reg].last = prev,
            Some(n) => self.records[n].prev = prev,
        }
        self.free.push(handle);
    }

    /// Update the operand index stored in a record after operands were shifted.
    pub fn set_index(&mut self, handle: RegOperand, index: usize) {
        self.records[handle].index = index as u32;
    }

    /// Iterate over all operands of `reg`, defs first.
    pub fn operands(&self, reg: VirtReg) -> RegOperandIter {
        RegOperandIter {
            lists: self,
            next: self.heads[reg].first.expand(),
        }
    }

    /// Iterate over the def operands of `reg`.
    pub fn defs(&self, reg: VirtReg) -> impl Iterator<Item = OperandRef> + '_ {
        self.records_of(reg)
            .take_while(|r| r.is_def)
            .map(Record::operand_ref)
    }

    /// Iterate over the use operands of `reg`.
    pub fn uses(&self, reg: VirtReg) -> impl Iterator<Item = OperandRef> + '_ {
        self.records_of(reg)
            .skip_while(|r| r.is_def)
            .map(Record::operand_ref)
    }

    /// Does `reg` have no def operands?
    pub fn def_empty(&self, reg: VirtReg) -> bool {
        self.defs(reg).next().is_none()
    }

    /// Does `reg` have no operands at all?
    pub fn is_empty(&self, reg: VirtReg) -> bool {
        self.heads[reg].first.is_none()
    }

    /// Number of operands referring to `reg`.
    pub fn len(&self, reg: VirtReg) -> usize {
        self.heads[reg].len as usize
    }

    fn records_of(&self, reg: VirtReg) -> impl Iterator<Item = &Record> + '_ {
        let mut next = self.heads[reg].first.expand();
        core::iter::from_fn(move || {
            let h = next?;
            let r = &self.records[h];
            next = r.next.expand();
            Some(r)
        })
    }

    /// Check the def-before-use ordering of every list.
    pub fn verify(&self) -> Result<(), String> {
        for (reg, _) in self.heads.iter() {
            let mut seen_use = false;
            let mut count = 0;
            for r in self.records_of(reg) {
                if r.reg != reg {
                    return Err(format!("{reg} list holds operand of {}", r.reg));
                }
                if r.is_def && seen_use {
                    return Err(format!("{reg} has a def after a use in its operand list"));
                }
                seen_use |= !r.is_def;
                count += 1;
            }
            if count != self.heads[reg].len {
                return Err(format!("{reg} operand count out of sync"));
            }
        }
        Ok(())
    }
}

impl Record {
    fn operand_ref(&self) -> OperandRef {
        OperandRef {
            inst: self.inst,
            index: self.index as usize,
        }
    }
}

/// Iterator over the operands of one register, defs first.
pub struct RegOperandIter<'a> {
    lists: &'a RegOperandLists,
    next: Option<RegOperand>,
}

impl<'a> Iterator for RegOperandIter<'a> {
    type Item = OperandRef;

    fn next(&mut self) -> Option<OperandRef> {
        let h = self.next?;
        let r = &self.lists.records[h];
        self.next = r.next.expand();
        Some(r.operand_ref())
    }
}
