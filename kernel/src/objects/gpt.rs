//! Guarded page tables
//!
//! A GPT is a node whose `node_data` holds its l2v (log2 of the span of one
//! slot) and two flags: slot 15 holds a keeper and slot 14 holds a
//! background key. This module decodes those fields and implements the
//! GPT and memory key protocols.

use super::header::{ObType, ObjRef};
use super::key::{Guard, KeyPerms, KeyType};
use super::keyring::SlotId;
use crate::config::{GPT_BACKGROUND_SLOT, GPT_KEEPER_SLOT, GPT_SLOTS, MAX_L2V, PAGE_L2V, WINDOW_BACKGROUND};
use crate::error::{RequestError, Step};
use crate::kernel::Kernel;
use crate::objects::key::{Key, WindowTarget};
use crate::platform::Platform;
use crate::process::ProcessRef;

/// Mask of the l2v in `node_data`
pub const GPT_L2V_MASK: u16 = 0x3f;
/// Slot 15 holds a keeper
pub const GPT_KEEPER: u16 = 0x40;
/// Slot 14 holds a background key
pub const GPT_BACKGROUND: u16 = 0x80;
/// The keeper receives a key to the GPT with each fault
pub const GPT_SEND_NODE: u16 = 0x100;

/// Invocation slot that carries the GPT key to a keeper
pub const RED_NODE_SLOT: u8 = 2;

/// Decoded GPT `node_data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptFields(u16);

impl GptFields {
    pub fn new(l2v: u32) -> Self {
        GptFields(l2v as u16 & GPT_L2V_MASK)
    }

    pub fn from_bits(bits: u16) -> Self {
        GptFields(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn l2v(&self) -> u32 {
        (self.0 & GPT_L2V_MASK) as u32
    }

    pub fn has_keeper(&self) -> bool {
        self.0 & GPT_KEEPER != 0
    }

    pub fn has_background(&self) -> bool {
        self.0 & GPT_BACKGROUND != 0
    }

    pub fn sends_node(&self) -> bool {
        self.0 & GPT_SEND_NODE != 0
    }

    pub fn with_l2v(self, l2v: u32) -> Self {
        GptFields((self.0 & !GPT_L2V_MASK) | (l2v as u16 & GPT_L2V_MASK))
    }

    pub fn with_keeper(self, send_node: bool) -> Self {
        let mut bits = self.0 | GPT_KEEPER;
        if send_node {
            bits |= GPT_SEND_NODE;
        } else {
            bits &= !GPT_SEND_NODE;
        }
        GptFields(bits)
    }

    pub fn without_keeper(self) -> Self {
        GptFields(self.0 & !(GPT_KEEPER | GPT_SEND_NODE))
    }

    pub fn with_background(self) -> Self {
        GptFields(self.0 | GPT_BACKGROUND)
    }

    pub fn without_background(self) -> Self {
        GptFields(self.0 & !GPT_BACKGROUND)
    }
}

/// Requests on GPT keys; the memory key requests apply to page keys too
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GptRequest {
    GetL2v,
    SetL2v { l2v: u32 },
    /// Copy slot `slot` into `to`
    GetSlot { slot: usize, to: SlotId },
    /// Copy the key in `from` into slot `slot`
    SetSlot { slot: usize, from: SlotId },
    /// Store a window key in `slot`
    SetWindow {
        slot: usize,
        /// Target slot, or `WINDOW_BACKGROUND`
        base_slot: u32,
        restrictions: KeyPerms,
        offset: u64,
    },
    /// Replace this GPT's contents with those of the GPT named in `from`
    Clone { from: SlotId },
    SetKeeper { from: SlotId, send_node: bool },
    ClearKeeper,
    SetBackground { from: SlotId },
    ClearBackground,
    GetRestrictions,
    /// Copy the invoked key into `to` with extra restrictions
    Reduce { restrictions: KeyPerms, to: SlotId },
    /// Copy the invoked key into `to` with a guard selecting `offset`
    MakeGuarded { offset: u64, to: SlotId },
    GetGuard,
    GetType,
}

/// Successful replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GptReply {
    Done,
    L2v(u32),
    Restrictions(KeyPerms),
    /// Offset selected by the key's guard
    Guard(u64),
    Type(KeyType),
    /// The request goes to the GPT's keeper instead; a non-opaque copy of
    /// the invoked key is in the red-node invocation slot
    ForwardToKeeper { keeper: Option<ProcessRef> },
}

impl<P: Platform> Kernel<P> {
    pub fn gpt_fields(&self, node: ObjRef) -> GptFields {
        GptFields::from_bits(self.node_data(node))
    }

    pub(crate) fn set_gpt_fields(&mut self, node: ObjRef, fields: GptFields) {
        self.set_node_data(node, fields.bits());
    }

    /// Drop every translation that depends on `gpt`'s layout
    pub(crate) fn invalidate_maps(&mut self, gpt: ObjRef) {
        if self.header(gpt).ob_type == ObType::Segment {
            self.release_products(gpt);
            self.clear_all_hazards(gpt);
        }
        self.unmap_all(gpt);
    }

    /// Invoke the GPT or page key in `key`
    pub fn invoke_gpt(&mut self, key: SlotId, req: GptRequest) -> Step<Result<GptReply, RequestError>> {
        self.prepare_key(key)?;
        let k = self.key_ref(key);
        let (kind, perms, obj) = (k.kind(), k.perms(), k.object_ref());
        let opaque = perms.contains(KeyPerms::OPAQUE);

        if let (KeyType::Gpt, Some(gpt)) = (kind, obj) {
            if opaque
                && self.gpt_fields(gpt).has_keeper()
                && !perms.intersects(KeyPerms::READ_ONLY | KeyPerms::NO_CALL | KeyPerms::WEAK)
            {
                return self.forward_to_keeper(key, gpt).map(Ok);
            }
        }
        if let Some(reply) = self.memory_request(key, req) {
            return Ok(reply);
        }
        let gpt = match obj {
            Some(g) if kind == KeyType::Gpt => g,
            _ => {
                return Ok(Err(RequestError::WrongKeyType {
                    expected: KeyType::Gpt,
                    found: kind,
                }))
            }
        };
        let fields = self.gpt_fields(gpt);
        if opaque && req != GptRequest::GetType {
            return Ok(Err(RequestError::Opaque));
        }

        let reply = match req {
            GptRequest::GetType => GptReply::Type(KeyType::Gpt),
            GptRequest::GetL2v => GptReply::L2v(fields.l2v()),
            GptRequest::SetL2v { l2v } => {
                if !(PAGE_L2V..=MAX_L2V).contains(&l2v) {
                    return Ok(Err(RequestError::InvalidL2v { l2v }));
                }
                self.invalidate_maps(gpt);
                self.set_gpt_fields(gpt, fields.with_l2v(l2v));
                GptReply::Done
            }
            GptRequest::GetSlot { slot, to } => {
                if slot >= GPT_SLOTS {
                    return Ok(Err(RequestError::SlotOutOfRange { slot }));
                }
                if let Err(e) = self.node_get_slot(gpt, slot, to, perms.contains(KeyPerms::WEAK)) {
                    return Ok(Err(e));
                }
                GptReply::Done
            }
            GptRequest::SetSlot { slot, from } => {
                if slot >= GPT_SLOTS {
                    return Ok(Err(RequestError::SlotOutOfRange { slot }));
                }
                if let Err(e) = self.node_set_slot(gpt, slot, from) {
                    return Ok(Err(e));
                }
                GptReply::Done
            }
            GptRequest::SetWindow {
                slot,
                base_slot,
                restrictions,
                offset,
            } => {
                let target = match base_slot {
                    b if b == WINDOW_BACKGROUND as u32 => WindowTarget::Background,
                    b if (b as usize) < GPT_SLOTS => WindowTarget::Local(b as usize),
                    b => return Ok(Err(RequestError::SlotOutOfRange { slot: b as usize })),
                };
                if slot >= GPT_SLOTS {
                    return Ok(Err(RequestError::SlotOutOfRange { slot }));
                }
                let allowed = KeyPerms::WEAK | KeyPerms::NO_CALL | KeyPerms::READ_ONLY;
                if !allowed.contains(restrictions) {
                    return Ok(Err(RequestError::InvalidRestrictions {
                        bits: restrictions.bits(),
                    }));
                }
                let l2v = fields.l2v();
                if offset & ((1u64 << l2v) - 1) != 0 {
                    return Ok(Err(RequestError::MisalignedWindow { offset }));
                }
                self.header_mut(gpt).make_dirty();
                self.write_key(SlotId::node(gpt, slot), Key::window(target, offset, restrictions));
                GptReply::Done
            }
            GptRequest::Clone { from } => {
                self.prepare_key(from)?;
                let found = self.key_ref(from).kind();
                if found != KeyType::Gpt {
                    return Ok(Err(RequestError::WrongKeyType {
                        expected: KeyType::Gpt,
                        found,
                    }));
                }
                self.invalidate_maps(gpt);
                if let Err(e) = self.node_clone(gpt, from)? {
                    return Ok(Err(e));
                }
                GptReply::Done
            }
            GptRequest::SetKeeper { from, send_node } => {
                if let Err(e) = self.node_set_slot(gpt, GPT_KEEPER_SLOT, from) {
                    return Ok(Err(e));
                }
                let fields = self.gpt_fields(gpt);
                self.set_gpt_fields(gpt, fields.with_keeper(send_node));
                GptReply::Done
            }
            GptRequest::ClearKeeper => {
                self.set_gpt_fields(gpt, fields.without_keeper());
                GptReply::Done
            }
            GptRequest::SetBackground { from } => {
                self.invalidate_maps(gpt);
                if let Err(e) = self.node_set_slot(gpt, GPT_BACKGROUND_SLOT, from) {
                    return Ok(Err(e));
                }
                let fields = self.gpt_fields(gpt);
                self.set_gpt_fields(gpt, fields.with_background());
                GptReply::Done
            }
            GptRequest::ClearBackground => {
                self.invalidate_maps(gpt);
                self.set_gpt_fields(gpt, fields.without_background());
                GptReply::Done
            }
            GptRequest::GetRestrictions
            | GptRequest::Reduce { .. }
            | GptRequest::MakeGuarded { .. }
            | GptRequest::GetGuard => fatal!("memory request fell through"),
        };
        Ok(Ok(reply))
    }

    /// Requests shared by every memory key; `None` for GPT-only requests
    fn memory_request(&mut self, key: SlotId, req: GptRequest) -> Option<Result<GptReply, RequestError>> {
        let k = self.key_ref(key);
        let kind = k.kind();
        let perms = k.perms();
        if !kind.is_memory_type() {
            return match req {
                GptRequest::GetRestrictions
                | GptRequest::Reduce { .. }
                | GptRequest::MakeGuarded { .. }
                | GptRequest::GetGuard => Some(Err(RequestError::WrongKeyType {
                    expected: KeyType::Gpt,
                    found: kind,
                })),
                _ => None,
            };
        }
        let reply = match req {
            GptRequest::GetRestrictions => GptReply::Restrictions(perms),
            GptRequest::GetGuard => GptReply::Guard(k.guard().offset()),
            GptRequest::Reduce { restrictions, to } => {
                if !KeyPerms::all().contains(restrictions) {
                    return Some(Err(RequestError::InvalidRestrictions {
                        bits: restrictions.bits(),
                    }));
                }
                self.key_set(to, key);
                self.key_ref_mut(to).set_perms(perms | restrictions);
                GptReply::Done
            }
            GptRequest::MakeGuarded { offset, to } => {
                let Some(guard) = Guard::from_offset(offset, PAGE_L2V) else {
                    return Some(Err(RequestError::UnrepresentableGuard { offset }));
                };
                self.key_set(to, key);
                self.key_ref_mut(to).set_guard(guard);
                GptReply::Done
            }
            GptRequest::GetType if kind == KeyType::Page => GptReply::Type(KeyType::Page),
            _ if kind == KeyType::Page => {
                return Some(Err(RequestError::WrongKeyType {
                    expected: KeyType::Gpt,
                    found: kind,
                }))
            }
            _ => return None,
        };
        Some(Ok(reply))
    }

    /// Pass an opaque GPT request to the GPT's keeper
    fn forward_to_keeper(&mut self, key: SlotId, gpt: ObjRef) -> Step<GptReply> {
        let red = SlotId::Invocation(RED_NODE_SLOT);
        self.key_set(red, key);
        let perms = self.key_ref(red).perms() - KeyPerms::OPAQUE;
        self.key_ref_mut(red).set_perms(perms);

        let keeper = self.keeper_process(gpt)?;
        log::debug!("opaque GPT request forwarded to keeper {:?}", keeper);
        Ok(GptReply::ForwardToKeeper { keeper })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_roundtrip_flags() {
        let f = GptFields::new(22).with_keeper(true).with_background();
        assert_eq!(f.l2v(), 22);
        assert!(f.has_keeper() && f.sends_node() && f.has_background());
        let f = f.without_keeper().with_l2v(30);
        assert!(!f.has_keeper() && !f.sends_node());
        assert!(f.has_background());
        assert_eq!(f.l2v(), 30);
    }
}
