// ============================================================================
// src/usb/dcd/reset.rs - Bus Reset / Controller Init
// ============================================================================
//!
//! コントローラの初期化、バスリセット、接続制御。
//!
//! ## 初期化手順
//! 1. `controller_reset()` - USBCMD.RST でコアをリセットし、デバイスモードを選択
//! 2. `init()` - バスリセット相当の初期化、ENDPOINTLISTADDR、割り込み有効化
//! 3. `connect()` - プルアップを有効にしてホストに見せる
//!
//! バスリセットはプール全体を一括で初期化できる唯一の経路。

use log::info;

use super::controller::{DcdStats, DeviceController, DeviceStack};
use super::endpoint::MAX_LOGICAL_ENDPOINTS;
use super::regs::{
    DEVICEADDR_ADVANCE, DEVICEADDR_SHIFT, EndpointControl, FLUSH_ALL, Register, RegisterAccess, USBMODE_CM_DEVICE,
    USBMODE_SLOM, UsbCommand,
};
use crate::error::DcdResult;
use crate::usb::{TransferDirection, TransferType};

/// DEVICEADDR に書けるアドレスの最大値
const MAX_DEVICE_ADDRESS: u8 = 0x7F;

impl<R: RegisterAccess, S: DeviceStack> DeviceController<R, S> {
    /// コアをリセットしてデバイスモードを選択する
    pub fn controller_reset(&self) -> DcdResult<()> {
        let regs = self.registers();

        regs.set_bits(Register::UsbCmd, UsbCommand::RESET.bits());
        self.wait_for("controller reset", |r| r.read(Register::UsbCmd) & UsbCommand::RESET.bits() == 0)?;
        regs.write(Register::UsbMode, USBMODE_CM_DEVICE | USBMODE_SLOM);

        info!("USB DCD{}: controller reset, device mode", self.id().as_u8());
        Ok(())
    }

    /// バスリセット
    ///
    /// 非コントロールエンドポイントを中立なバルクタイプに戻し、保留中の
    /// ステータスを全てクリアし、プライム完了を待ってから全エンドポイントを
    /// フラッシュし、最後にプールを初期化する。ポーリングがタイムアウトした
    /// 場合はプールに触れずに `Timeout` を返す。
    pub fn bus_reset(&self) -> DcdResult<()> {
        let regs = self.registers();

        self.with_pool(|pool| -> DcdResult<()> {
            // 片方向だけ有効なエンドポイントの反対側がコントロールタイプのままだと
            // データ PID の追跡が未定義になる
            let neutral = EndpointControl::with_type(TransferType::Bulk.as_u8());
            let neutral = neutral.shifted(TransferDirection::Out) | neutral.shifted(TransferDirection::In);
            for n in 1..MAX_LOGICAL_ENDPOINTS as u8 {
                regs.write(Register::EndptCtrl(n), neutral);
            }

            regs.write_back(Register::EndptNak);
            regs.write(Register::EndptNakEn, 0);
            regs.write_back(Register::UsbSts);
            regs.write_back(Register::EndptSetupStat);
            regs.write_back(Register::EndptComplete);

            self.wait_for("endpoint prime", |r| r.read(Register::EndptPrime) == 0)?;
            regs.write(Register::EndptFlush, FLUSH_ALL);
            self.wait_for("endpoint flush", |r| r.read(Register::EndptFlush) == 0)?;

            pool.reset(self.config().control_max_packet_size);
            Ok(())
        })?;

        DcdStats::record(&self.counters().bus_resets);
        info!("USB DCD{}: bus reset", self.id().as_u8());
        Ok(())
    }

    /// コントローラを初期化する
    ///
    /// この呼び出し以降、ハードウェアはコントローラ内のプールを直接参照する。
    /// プールがコントローラの DMA 空間外にあれば、ハードウェアに触れずに
    /// `DmaOutOfRange` を返す。
    pub fn init(&self) -> DcdResult<()> {
        let list = self.with_pool(|pool| pool.queue_head_list_address())?;
        self.bus_reset()?;

        let regs = self.registers();
        // 割り込み閾値 0（即時）
        regs.clear_bits(Register::UsbCmd, UsbCommand::ITC_MASK);

        regs.write(Register::EndpointListAddr, list.as_u32());
        regs.write(Register::UsbIntr, self.config().interrupts.bits());

        info!(
            "USB DCD{}: initialized (endpoint list {:#010x}, interrupts {:?})",
            self.id().as_u8(),
            list.as_u32(),
            self.config().interrupts
        );
        Ok(())
    }

    /// バスに接続する (Run)
    pub fn connect(&self) {
        self.registers().set_bits(Register::UsbCmd, UsbCommand::RUN_STOP.bits());
        info!("USB DCD{}: connected", self.id().as_u8());
    }

    /// バスから切断する (Stop)
    pub fn disconnect(&self) {
        self.registers().clear_bits(Register::UsbCmd, UsbCommand::RUN_STOP.bits());
        info!("USB DCD{}: disconnected", self.id().as_u8());
    }

    /// デバイスアドレスを設定
    ///
    /// USBADRA によりステータスステージ完了後に適用されるため、
    /// SET_ADDRESS のステータス応答を待たずに呼んでよい。
    pub fn set_address(&self, address: u8) {
        let value = (((address & MAX_DEVICE_ADDRESS) as u32) << DEVICEADDR_SHIFT) | DEVICEADDR_ADVANCE;
        self.registers().write(Register::DeviceAddr, value);
        info!("USB DCD{}: address {}", self.id().as_u8(), address & MAX_DEVICE_ADDRESS);
    }
}
