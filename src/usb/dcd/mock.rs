// ============================================================================
// src/usb/dcd/mock.rs - Test Hardware Model
// ============================================================================
//!
//! テスト用のレジスタモデルと記録用デバイススタック。
//!
//! ## レジスタの振る舞い
//! - USBSTS / ENDPTSETUPSTAT / ENDPTCOMPLETE / ENDPTNAK: 1を書くとクリア
//! - ENDPTPRIME / ENDPTFLUSH: 書き込みはログに残り、読むと 0（即時完了）
//! - USBCMD.RST: 書き込み直後にクリアされる
//! - USBCMD.ATDTW: `knock_down_tripwire` で指定した回数だけ、立てた直後に
//!   ハードウェアが落とす（dQH 更新との競合）
//! - `stuck` モードではプライム/フラッシュ/リセットがいつまでも完了しない

use std::collections::HashMap;

use spin::Mutex;

use super::controller::{DeviceController, DeviceStack, TransferEvent};
use super::endpoint::{EndpointHandle, PhysicalSlot};
use super::qtd::TokenStatus;
use super::regs::{InterruptFlags, Register, RegisterAccess, UsbCommand};
use crate::config::DcdConfig;
use crate::error::DcdError;
use crate::usb::{ControllerId, SetupPacket};

#[derive(Default)]
struct MockState {
    values: HashMap<usize, u32>,
    log: Vec<(Register, u32)>,
    stuck: bool,
    tripwire_knockdowns: u32,
}

/// レジスタモデル
#[derive(Default)]
pub(crate) struct MockRegisters {
    state: Mutex<MockState>,
}

impl MockRegisters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 書き込みの副作用なしに値を設定（ハードウェア側の変化を模擬）
    pub(crate) fn set(&self, reg: Register, value: u32) {
        self.state.lock().values.insert(reg.offset(), value);
    }

    /// 値にビットを足す（ハードウェア側の変化を模擬）
    pub(crate) fn raise(&self, reg: Register, bits: u32) {
        *self.state.lock().values.entry(reg.offset()).or_insert(0) |= bits;
    }

    /// プライム/フラッシュ/リセットを完了させない
    pub(crate) fn set_stuck(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    /// 次の `count` 回、立てた Add dTD Tripwire を落とす
    pub(crate) fn knock_down_tripwire(&self, count: u32) {
        self.state.lock().tripwire_knockdowns = count;
    }

    /// レジスタへの書き込み値（古い順）
    pub(crate) fn writes_to(&self, reg: Register) -> Vec<u32> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    pub(crate) fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl RegisterAccess for MockRegisters {
    fn read(&self, reg: Register) -> u32 {
        self.state.lock().values.get(&reg.offset()).copied().unwrap_or(0)
    }

    fn write(&self, reg: Register, value: u32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.log.push((reg, value));
        let slot = state.values.entry(reg.offset()).or_insert(0);

        match reg {
            Register::UsbSts | Register::EndptSetupStat | Register::EndptComplete | Register::EndptNak => {
                *slot &= !value;
            }
            Register::EndptPrime | Register::EndptFlush => {
                *slot = if state.stuck { value } else { 0 };
            }
            Register::UsbCmd => {
                let mut value = value;
                if !state.stuck {
                    value &= !UsbCommand::RESET.bits();
                }
                let tripwire = UsbCommand::ADD_QTD_TRIPWIRE.bits();
                if value & tripwire != 0 && state.tripwire_knockdowns > 0 {
                    state.tripwire_knockdowns -= 1;
                    value &= !tripwire;
                }
                *slot = value;
            }
            _ => *slot = value,
        }
    }
}

// ============================================================================
// Recording Device Stack
// ============================================================================

/// デバイススタックへの通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackEvent {
    BusReset(ControllerId),
    Setup(ControllerId, SetupPacket),
    Transfer(EndpointHandle, TransferEvent, u16),
    ControllerError(ControllerId, DcdError),
}

/// 通知を順に記録するデバイススタック
#[derive(Default)]
pub(crate) struct RecordingStack {
    events: Mutex<Vec<StackEvent>>,
}

impl RecordingStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn events(&self) -> Vec<StackEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn take(&self) -> Vec<StackEvent> {
        core::mem::take(&mut *self.events.lock())
    }
}

impl DeviceStack for RecordingStack {
    fn bus_reset(&self, controller: ControllerId) {
        self.events.lock().push(StackEvent::BusReset(controller));
    }

    fn setup_received(&self, controller: ControllerId, setup: &SetupPacket) {
        self.events.lock().push(StackEvent::Setup(controller, *setup));
    }

    fn transfer_complete(&self, endpoint: EndpointHandle, event: TransferEvent, actual_bytes: u16) {
        self.events.lock().push(StackEvent::Transfer(endpoint, event, actual_bytes));
    }

    fn controller_error(&self, controller: ControllerId, err: DcdError) {
        self.events.lock().push(StackEvent::ControllerError(controller, err));
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) type TestController = DeviceController<MockRegisters, RecordingStack>;

/// 初期化済みのコントローラ
pub(crate) fn controller(config: DcdConfig) -> Box<TestController> {
    let dcd = Box::new(DeviceController::new(
        ControllerId(0),
        MockRegisters::new(),
        RecordingStack::new(),
        config,
    ));
    dcd.pool().lock().map_into_bus_window();
    dcd.init().unwrap();
    dcd.registers().clear_log();
    dcd.stack().take();
    dcd
}

/// ハードウェアがキュー先頭の QTD を処理し終えたことを模擬する
pub(crate) fn complete_head(dcd: &TestController, slot: PhysicalSlot, remaining: u16, errors: TokenStatus) {
    let mut pool = dcd.pool().lock();
    let index = pool.qhd(slot).queue_head().unwrap();
    pool.qtd_mut(index).complete(remaining, errors);
}

/// 同じコントローラへ再投入できるよう `'static` にした初期化済みコントローラ
pub(crate) fn leaked_controller<S: DeviceStack + 'static>(stack: S) -> &'static DeviceController<MockRegisters, S> {
    let dcd: &'static DeviceController<MockRegisters, S> = Box::leak(Box::new(DeviceController::new(
        ControllerId(0),
        MockRegisters::new(),
        stack,
        DcdConfig::new(),
    )));
    dcd.pool().lock().map_into_bus_window();
    dcd.init().unwrap();
    dcd.registers().clear_log();
    dcd
}

/// 転送完了割り込みを発生させる
pub(crate) fn raise_complete(dcd: &TestController, bits: u32) -> InterruptFlags {
    dcd.registers().raise(Register::EndptComplete, bits);
    dcd.registers().raise(Register::UsbSts, InterruptFlags::USB.bits());
    dcd.handle_interrupt()
}

/// セットアップパケット受信を模擬する
pub(crate) fn raise_setup(dcd: &TestController, setup: &SetupPacket) -> InterruptFlags {
    dcd.pool().lock().qhd_mut(PhysicalSlot::CONTROL_OUT).write_setup(setup);
    dcd.registers().raise(Register::EndptSetupStat, 1);
    dcd.registers().raise(Register::UsbSts, InterruptFlags::USB.bits());
    dcd.handle_interrupt()
}
