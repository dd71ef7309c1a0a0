// ============================================================================
// src/usb/dcd/control.rs - Control Transfer Handler
// ============================================================================
//!
//! コントロールパイプ（スロット 0 = OUT, 1 = IN）のデータ/ステータスフェーズ。
//!
//! 予約済みの QTD 0（データ）と QTD 1（ステータス）だけを使うため、
//! コントロール転送が共有プールを枯渇させることはない。

use log::debug;

use super::controller::{DeviceController, DeviceStack};
use super::endpoint::PhysicalSlot;
use super::pool::{CONTROL_DATA_QTD, CONTROL_STATUS_QTD};
use super::qtd::DmaBuffer;
use super::regs::{EndpointControl, InterruptMask, Register, RegisterAccess};
use crate::error::{DcdError, DcdResult};
use crate::usb::TransferDirection;

impl<R: RegisterAccess, S: DeviceStack> DeviceController<R, S> {
    /// コントロール転送のデータフェーズとステータスフェーズを準備してプライムする
    ///
    /// - データフェーズは `direction` 側のスロット（長さ 0 なら省略）
    /// - ステータスフェーズは長さ 0 で、データフェーズの反対側。
    ///   データフェーズがなければ IN (スロット 1)
    /// - 両方のプライムビットを1回の書き込みでセットする
    pub fn control_transfer(&self, direction: TransferDirection, buffer: &DmaBuffer) -> DcdResult<()> {
        self.with_pool(|pool| -> DcdResult<()> {
            if pool.qhd(PhysicalSlot::CONTROL_OUT).is_active() || pool.qhd(PhysicalSlot::CONTROL_IN).is_active() {
                return Err(DcdError::Busy);
            }
            let data_addr = pool.qtd_address(CONTROL_DATA_QTD)?;
            let status_addr = pool.qtd_address(CONTROL_STATUS_QTD)?;

            let mut prime = 0;

            let status_slot = if buffer.is_empty() {
                PhysicalSlot::CONTROL_IN
            } else {
                let data_slot = PhysicalSlot::from_logical(0, direction);
                pool.init_descriptor(CONTROL_DATA_QTD, buffer);
                pool.qhd_mut(data_slot).attach(data_addr);
                prime |= data_slot.mask();
                data_slot.opposite()
            };

            pool.init_descriptor(CONTROL_STATUS_QTD, &DmaBuffer::EMPTY);
            pool.qhd_mut(status_slot).attach(status_addr);
            prime |= status_slot.mask();

            self.registers().write(Register::EndptPrime, prime);

            debug!(
                "USB DCD{}: control {:?} {} bytes, prime {:#010x}",
                self.id().as_u8(),
                direction,
                buffer.len(),
                prime
            );
            Ok(())
        })
    }

    /// コントロールエンドポイントを両方向とも STALL させる
    ///
    /// ハードウェアは次のセットアップパケット受信時に自動で解除する。
    pub fn control_stall(&self) {
        let stall = EndpointControl::STALL.shifted(TransferDirection::Out)
            | EndpointControl::STALL.shifted(TransferDirection::In);

        let _mask = InterruptMask::new(self.registers());
        self.registers().set_bits(Register::EndptCtrl(0), stall);
        debug!("USB DCD{}: control pipe stalled", self.id().as_u8());
    }
}
