// ============================================================================
// src/usb/dcd/controller.rs - Device Controller
// ============================================================================
//!
//! デバイスコントローラ本体とデバイススタック境界。
//!
//! ## 所有関係
//! - `DeviceController` がレジスタブロック、ディスクリプタプール、
//!   デバイススタックへの参照を所有する
//! - プールは `spin::Mutex` で保護し、フォアグラウンドからの変更は
//!   [`InterruptMask`] の中で行う
//! - デバイススタックへのコールバックは常にプールのロックを外してから呼ぶ
//!
//! ## 配置
//! `init()` 後はハードウェアがプール内の QHD を直接参照するため、
//! コントローラを移動してはならない。通常は `static` に置く。

use core::sync::atomic::{AtomicU32, Ordering};

use log::{error, warn};
use spin::Mutex;

use super::endpoint::EndpointHandle;
use super::pool::DescriptorPool;
use super::regs::{InterruptMask, Register, RegisterAccess};
use crate::config::DcdConfig;
use crate::error::{DcdError, DcdResult};
use crate::usb::{ControllerId, SetupPacket};

// ============================================================================
// Device Stack Boundary
// ============================================================================

/// 転送完了の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// 正常完了
    Complete,
    /// トランザクションエラー / HALT / バッファエラー
    Error,
}

/// 上位のデバイススタック
///
/// 割り込みコンテキストから呼ばれる。実装は内部可変性で状態を持つこと。
pub trait DeviceStack {
    /// バスリセット完了後に呼ばれる
    fn bus_reset(&self, controller: ControllerId);

    /// セットアップパケット受信
    fn setup_received(&self, controller: ControllerId, setup: &SetupPacket);

    /// 完了通知付きで投入した転送が終わった
    fn transfer_complete(&self, endpoint: EndpointHandle, event: TransferEvent, actual_bytes: u16);

    /// コントローラがエラー割り込みを報告した
    fn controller_error(&self, controller: ControllerId, err: DcdError) {
        error!("USB DCD{}: {}", controller.as_u8(), err);
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// DCD統計
pub struct DcdStats {
    /// 正常完了した転送数
    pub transfers_completed: AtomicU32,
    /// エラー終了した転送数
    pub transfer_errors: AtomicU32,
    /// 受信したセットアップパケット数
    pub setups_received: AtomicU32,
    /// バスリセット回数
    pub bus_resets: AtomicU32,
    /// コントローラエラー回数
    pub controller_errors: AtomicU32,
}

impl DcdStats {
    const fn new() -> Self {
        Self {
            transfers_completed: AtomicU32::new(0),
            transfer_errors: AtomicU32::new(0),
            setups_received: AtomicU32::new(0),
            bus_resets: AtomicU32::new(0),
            controller_errors: AtomicU32::new(0),
        }
    }

    pub(crate) fn record(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// スナップショットを取得
    pub fn snapshot(&self) -> DcdStatsSnapshot {
        DcdStatsSnapshot {
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfer_errors: self.transfer_errors.load(Ordering::Relaxed),
            setups_received: self.setups_received.load(Ordering::Relaxed),
            bus_resets: self.bus_resets.load(Ordering::Relaxed),
            controller_errors: self.controller_errors.load(Ordering::Relaxed),
        }
    }
}

/// 統計のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcdStatsSnapshot {
    pub transfers_completed: u32,
    pub transfer_errors: u32,
    pub setups_received: u32,
    pub bus_resets: u32,
    pub controller_errors: u32,
}

// ============================================================================
// Device Controller
// ============================================================================

/// デバイスコントローラ
pub struct DeviceController<R: RegisterAccess, S: DeviceStack> {
    id: ControllerId,
    regs: R,
    stack: S,
    config: DcdConfig,
    pool: Mutex<DescriptorPool>,
    stats: DcdStats,
}

impl<R: RegisterAccess, S: DeviceStack> DeviceController<R, S> {
    /// コントローラを作成（ハードウェアには触れない）
    pub const fn new(id: ControllerId, regs: R, stack: S, config: DcdConfig) -> Self {
        let bus_offset = config.dma_offset;
        Self {
            id,
            regs,
            stack,
            config,
            pool: Mutex::new(DescriptorPool::new(bus_offset)),
            stats: DcdStats::new(),
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn config(&self) -> &DcdConfig {
        &self.config
    }

    /// 統計を取得
    pub fn stats(&self) -> DcdStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &DcdStats {
        &self.stats
    }

    pub(crate) fn pool(&self) -> &Mutex<DescriptorPool> {
        &self.pool
    }

    /// 割り込みをマスクしてプールを操作する
    pub(crate) fn with_pool<T, F: FnOnce(&mut DescriptorPool) -> T>(&self, f: F) -> T {
        let _mask = InterruptMask::new(&self.regs);
        let mut pool = self.pool.lock();
        f(&mut pool)
    }

    /// 条件が成立するまで上限付きでスピンする
    pub(crate) fn wait_for<F: FnMut(&R) -> bool>(&self, what: &str, mut done: F) -> DcdResult<()> {
        for _ in 0..self.config.poll_timeout_loops {
            if done(&self.regs) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        if done(&self.regs) {
            return Ok(());
        }

        warn!("USB DCD{}: timed out waiting for {}", self.id.as_u8(), what);
        Err(DcdError::Timeout)
    }

    /// エンドポイントをフラッシュし、ENDPTSTAT から消えるまで繰り返す
    pub(crate) fn flush_endpoints(&self, mask: u32) -> DcdResult<()> {
        for _ in 0..self.config.poll_timeout_loops {
            self.regs.write(Register::EndptFlush, mask);
            self.wait_for("endpoint flush", |r| r.read(Register::EndptFlush) & mask == 0)?;
            if self.regs.read(Register::EndptStat) & mask == 0 {
                return Ok(());
            }
        }

        warn!("USB DCD{}: endpoints {:#010x} still primed after flush", self.id.as_u8(), mask);
        Err(DcdError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::dcd::mock::{MockRegisters, RecordingStack};

    #[test]
    fn test_with_pool_masks_interrupts() {
        let regs = MockRegisters::new();
        regs.set(Register::UsbIntr, 0x147);
        let dcd = DeviceController::new(ControllerId(0), regs, RecordingStack::new(), DcdConfig::new());

        dcd.with_pool(|_| assert_eq!(dcd.registers().read(Register::UsbIntr), 0));
        assert_eq!(dcd.registers().read(Register::UsbIntr), 0x147);
    }

    #[test]
    fn test_wait_for_times_out() {
        let config = DcdConfig::new().with_poll_timeout_loops(4);
        let dcd = DeviceController::new(ControllerId(1), MockRegisters::new(), RecordingStack::new(), config);

        let mut polls = 0;
        let result = dcd.wait_for("nothing", |_| {
            polls += 1;
            false
        });
        assert_eq!(result, Err(DcdError::Timeout));
        assert_eq!(polls, 5);
        assert_eq!(dcd.wait_for("immediate", |_| true), Ok(()));
    }

    #[test]
    fn test_stats_snapshot() {
        let dcd = DeviceController::new(ControllerId(0), MockRegisters::new(), RecordingStack::new(), DcdConfig::new());
        DcdStats::record(&dcd.counters().bus_resets);
        DcdStats::record(&dcd.counters().bus_resets);
        assert_eq!(dcd.stats().bus_resets, 2);
        assert_eq!(dcd.stats().transfers_completed, 0);
    }
}
