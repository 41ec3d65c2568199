//! 单槽在途令牌
//!
//! 同一时刻最多一个发送处于在途状态。令牌在 drop 时释放槽位，
//! 因此无论成功、失败还是任务 panic，槽位都会被清空

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct SlotState {
    held: AtomicBool,
    claims: AtomicU64,
    releases: AtomicU64,
}

/// 单槽位
#[derive(Debug, Clone, Default)]
pub struct InFlightSlot {
    state: Arc<SlotState>,
}

/// 在途令牌，持有期间槽位被占用
#[derive(Debug)]
#[must_use = "dropping the token releases the slot immediately"]
pub struct InFlightToken {
    state: Arc<SlotState>,
}

impl InFlightSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用槽位，已被占用时返回 None
    pub fn try_claim(&self) -> Option<InFlightToken> {
        self.state
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.state.claims.fetch_add(1, Ordering::Relaxed);
        Some(InFlightToken {
            state: self.state.clone(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.state.held.load(Ordering::Acquire)
    }

    /// 累计占用次数
    pub fn claims(&self) -> u64 {
        self.state.claims.load(Ordering::Relaxed)
    }

    /// 累计释放次数
    pub fn releases(&self) -> u64 {
        self.state.releases.load(Ordering::Relaxed)
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.state.releases.fetch_add(1, Ordering::Relaxed);
        self.state.held.store(false, Ordering::Release);
    }
}
