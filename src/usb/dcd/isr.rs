// ============================================================================
// src/usb/dcd/isr.rs - Completion Dispatcher
// ============================================================================
//!
//! コントローラ割り込みのサービス。
//!
//! ## 処理順
//! 1. USBSTS & USBINTR を読み、即座に書き戻して確認応答
//! 2. バスリセット → プール再初期化 → `DeviceStack::bus_reset`
//! 3. セットアップ受信 → QHD 0 から取り込み → ENDPTSETUPSTAT を確認応答
//!    （クリアした瞬間に次のパケットがラッチされるため、この順序は必須）。
//!    実行中のコントロール転送をフラッシュできなければパケットは捨てる
//! 4. 転送完了 → 非コントロールスロットのキューを先頭から回収
//! 5. エラー → [`ControllerErrorPolicy`] に従う
//!
//! 回収した完了はバッチに溜め、プールのロックを外してから通知する。
//!
//! [`ControllerErrorPolicy`]: crate::config::ControllerErrorPolicy

use log::{trace, warn};

use super::controller::{DcdStats, DeviceController, DeviceStack, TransferEvent};
use super::endpoint::{EndpointHandle, MAX_SLOTS, PhysicalSlot};
use super::qhd::QTD_PER_QHD;
use super::regs::{InterruptFlags, Register, RegisterAccess};
use crate::config::ControllerErrorPolicy;
use crate::error::DcdError;

/// 1回の割り込みで回収できる完了の最大数
const BATCH_CAPACITY: usize = MAX_SLOTS * QTD_PER_QHD;

/// 通知待ちの完了
#[derive(Debug, Clone, Copy)]
struct Completion {
    handle: EndpointHandle,
    event: TransferEvent,
    actual_bytes: u16,
}

/// 固定長の完了バッチ（割り込みコンテキストでは確保しない）
struct CompletionBatch {
    entries: [Option<Completion>; BATCH_CAPACITY],
    len: usize,
}

impl CompletionBatch {
    const fn new() -> Self {
        Self {
            entries: [None; BATCH_CAPACITY],
            len: 0,
        }
    }

    fn push(&mut self, completion: Completion) {
        // 各スロットのキューは QTD_PER_QHD 個までなので溢れない
        debug_assert!(self.len < BATCH_CAPACITY);
        if let Some(entry) = self.entries.get_mut(self.len) {
            *entry = Some(completion);
            self.len += 1;
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Completion> {
        self.entries[..self.len].iter().flatten()
    }
}

impl<R: RegisterAccess, S: DeviceStack> DeviceController<R, S> {
    /// 割り込みハンドラ
    ///
    /// 処理した（確認応答した）割り込みフラグを返す。
    pub fn handle_interrupt(&self) -> InterruptFlags {
        let regs = self.registers();

        let raw = regs.read(Register::UsbSts) & regs.read(Register::UsbIntr);
        regs.write(Register::UsbSts, raw);
        if raw == 0 {
            return InterruptFlags::empty();
        }
        let status = InterruptFlags::from_bits_truncate(raw);

        if cfg!(feature = "verbose_logging") {
            trace!("USB DCD{}: interrupt {:?}", self.id().as_u8(), status);
        }

        if status.contains(InterruptFlags::RESET) {
            self.service_bus_reset();
        }

        if status.contains(InterruptFlags::USB) {
            if regs.read(Register::EndptSetupStat) != 0 {
                self.service_setup();
            }

            let complete = regs.read(Register::EndptComplete);
            if complete != 0 {
                regs.write(Register::EndptComplete, complete);
                self.service_completions(complete);
            }
        }

        if status.contains(InterruptFlags::ERROR) {
            self.service_controller_error();
        }

        // SOF / サスペンド / ポート変化 / NAK は確認応答のみ
        let ignored = InterruptFlags::SOF | InterruptFlags::SUSPEND | InterruptFlags::PORT_CHANGE | InterruptFlags::NAK;
        if status.intersects(ignored) && cfg!(feature = "verbose_logging") {
            trace!("USB DCD{}: unhandled {:?}", self.id().as_u8(), status & ignored);
        }

        status
    }

    fn service_bus_reset(&self) {
        match self.bus_reset() {
            Ok(()) => self.stack().bus_reset(self.id()),
            Err(e) => self.stack().controller_error(self.id(), e),
        }
    }

    fn service_setup(&self) {
        let regs = self.registers();

        // 取り込みは確認応答より前
        let setup = self.pool().lock().qhd(PhysicalSlot::CONTROL_OUT).setup_request();
        regs.write_back(Register::EndptSetupStat);

        let superseded = {
            let pool = self.pool().lock();
            pool.qhd(PhysicalSlot::CONTROL_OUT).is_active() || pool.qhd(PhysicalSlot::CONTROL_IN).is_active()
        };
        if superseded {
            let mask = PhysicalSlot::CONTROL_OUT.mask() | PhysicalSlot::CONTROL_IN.mask();
            match self.flush_endpoints(mask) {
                Ok(()) => {
                    let mut pool = self.pool().lock();
                    pool.qhd_mut(PhysicalSlot::CONTROL_OUT).clear_active();
                    pool.qhd_mut(PhysicalSlot::CONTROL_IN).clear_active();
                }
                Err(e) => {
                    // オーバーレイが Active のままでは応答できないので渡さない。
                    // ホストの再送かバスリセットで回復する
                    warn!(
                        "USB DCD{}: superseded control transfer not flushed, setup dropped",
                        self.id().as_u8()
                    );
                    self.stack().controller_error(self.id(), e);
                    return;
                }
            }
        }

        DcdStats::record(&self.counters().setups_received);
        self.stack().setup_received(self.id(), &setup);
    }

    fn service_completions(&self, complete: u32) {
        let mut batch = CompletionBatch::new();

        {
            let mut pool = self.pool().lock();
            // コントロールの完了はセットアップ駆動で扱うためここでは見ない
            for slot in PhysicalSlot::non_control().filter(|slot| complete & slot.mask() != 0) {
                let qhd = pool.qhd(slot);
                let handle = EndpointHandle {
                    controller: self.id(),
                    transfer_type: qhd.transfer_type(),
                    slot,
                    class: qhd.class(),
                };

                pool.retire(slot, |retired| {
                    if cfg!(feature = "verbose_logging") {
                        trace!(
                            "USB DCD{}: slot {} retired qtd {} ({} bytes, error={})",
                            handle.controller.as_u8(),
                            slot.0,
                            retired.qtd_index,
                            retired.transferred,
                            retired.error
                        );
                    }
                    if retired.notify {
                        batch.push(Completion {
                            handle,
                            event: if retired.error { TransferEvent::Error } else { TransferEvent::Complete },
                            actual_bytes: retired.transferred,
                        });
                    }
                });
            }
        }

        for completion in batch.iter() {
            let counter = match completion.event {
                TransferEvent::Complete => &self.counters().transfers_completed,
                TransferEvent::Error => &self.counters().transfer_errors,
            };
            DcdStats::record(counter);
            self.stack().transfer_complete(completion.handle, completion.event, completion.actual_bytes);
        }
    }

    fn service_controller_error(&self) {
        DcdStats::record(&self.counters().controller_errors);

        if self.config().error_policy == ControllerErrorPolicy::ResetBus {
            warn!("USB DCD{}: controller error, resetting bus", self.id().as_u8());
            self.service_bus_reset();
        }
        self.stack().controller_error(self.id(), DcdError::ControllerError);
    }
}
