/*
* Every readiness backend lets us stash a 64-bit word next to a registration
* (epoll_event.data, the SQE user_data). We store a channel handle there, never
* a pointer, so an event that outlives its channel can be detected:
*
* 1. Which arena slot the event is for.
*
* 2. Which incarnation of that slot (generation), so a recycled slot does not
*    receive events meant for the channel that lived there before.
*
* 3. Which submission produced it (only the ring backend needs this).
*/

use crate::core::channel::ChannelHandle;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TokenOp {
    Readiness = 0,
    PollRemove = 1,
}

impl TokenOp {
    #[inline]
    pub fn try_from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => TokenOp::Readiness,
            1 => TokenOp::PollRemove,
            _ => return None,
        })
    }
}

const OP_BITS: u64 = 8;
const GEN_BITS: u64 = 24;
const INDEX_BITS: u64 = 64 - (OP_BITS + GEN_BITS);

const OP_MASK: u64 = (1 << OP_BITS) - 1; // 0xFF
pub const GEN_MASK: u64 = (1 << GEN_BITS) - 1; // 0xFF_FFFF
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1; // 0xFFFF_FFFF

const OP_SHIFT: u64 = 0;
const GEN_SHIFT: u64 = OP_SHIFT + OP_BITS; // 8
const INDEX_SHIFT: u64 = GEN_SHIFT + GEN_BITS; // 32

#[inline]
pub fn pack_token(handle: ChannelHandle, op: TokenOp) -> u64 {
    let index = handle.index as u64;
    let generation = handle.generation as u64;
    debug_assert!((generation & !GEN_MASK) == 0, "generation exceeds 24 bits");

    ((index & INDEX_MASK) << INDEX_SHIFT)
        | ((generation & GEN_MASK) << GEN_SHIFT)
        | ((op as u64) & OP_MASK)
}

/// Returns `None` for an op tag this build never produces.
#[inline]
pub fn unpack_token(token: u64) -> Option<(ChannelHandle, TokenOp)> {
    let index = ((token >> INDEX_SHIFT) & INDEX_MASK) as u32;
    let generation = ((token >> GEN_SHIFT) & GEN_MASK) as u32;
    let op = TokenOp::try_from_u8(((token >> OP_SHIFT) & OP_MASK) as u8)?;
    Some((ChannelHandle { index, generation }, op))
}
