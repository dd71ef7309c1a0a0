// ============================================================================
// src/usb/dcd/pipe.rs - Pipe Manager
// ============================================================================
//!
//! 非コントロールエンドポイント（バルク/インタラプト）のパイプ操作。
//!
//! ## 転送の流れ
//! 1. `queue_transfer` / `start_transfer` が QTD を確保して QHD のキューに繋ぐ
//! 2. `start_transfer` はエンドポイントが動いていなければ先頭の Active な
//!    QTD をオーバーレイに接続してプライムする
//! 3. 完了は割り込みサービス ([`handle_interrupt`]) が FIFO 順に回収して通知する
//!
//! [`handle_interrupt`]: super::DeviceController::handle_interrupt

use log::{debug, info, warn};

use super::controller::{DeviceController, DeviceStack};
use super::endpoint::{EndpointHandle, MAX_LOGICAL_ENDPOINTS, PhysicalSlot};
use super::qtd::DmaBuffer;
use super::regs::{EndpointControl, InterruptMask, Register, RegisterAccess, UsbCommand};
use crate::error::{DcdError, DcdResult};
use crate::usb::{ClassId, EndpointDescriptor, TransferType};

impl<R: RegisterAccess, S: DeviceStack> DeviceController<R, S> {
    /// エンドポイント制御レジスタの該当方向ハーフ
    fn endpoint_control(&self, slot: PhysicalSlot) -> EndpointControl {
        let value = self.registers().read(Register::EndptCtrl(slot.logical()));
        EndpointControl::from_register(value, slot.direction())
    }

    /// 非コントロールのパイプとして使えるハンドルか検証
    fn check_handle(&self, handle: &EndpointHandle) -> DcdResult<()> {
        if !handle.slot.is_valid() || handle.slot.is_control() {
            return Err(DcdError::InvalidEndpoint);
        }
        if handle.transfer_type == TransferType::Isochronous {
            return Err(DcdError::Unsupported);
        }
        Ok(())
    }

    // ========================================================================
    // Open / Close
    // ========================================================================

    /// パイプをオープン
    ///
    /// QHD を初期化して能力フィールドを設定し、エンドポイントを有効化する。
    pub fn open_pipe(&self, descriptor: &EndpointDescriptor, class: ClassId) -> DcdResult<EndpointHandle> {
        let transfer_type = descriptor.transfer_type();
        if transfer_type == TransferType::Isochronous {
            warn!("USB DCD{}: isochronous endpoint {:#04x} not supported", self.id().as_u8(), descriptor.address().0);
            return Err(DcdError::Unsupported);
        }

        let address = descriptor.address();
        if address.number() as usize >= MAX_LOGICAL_ENDPOINTS || address.number() == 0 {
            return Err(DcdError::InvalidEndpoint);
        }
        let slot = PhysicalSlot::from_address(address);
        let direction = slot.direction();
        let ctrl = Register::EndptCtrl(slot.logical());

        self.with_pool(|pool| {
            if self.endpoint_control(slot).contains(EndpointControl::ENABLE) {
                warn!("USB DCD{}: endpoint {:#04x} already open", self.id().as_u8(), address.0);
                return Err(DcdError::AlreadyOpen);
            }

            let qhd = pool.qhd_mut(slot);
            qhd.clear();
            qhd.set_owner(class, transfer_type);
            qhd.configure(descriptor.max_packet_size(), true, false);

            // リセット時のバルク設定を実際のタイプで置き換える
            let enable = EndpointControl::with_type(transfer_type.as_u8())
                | EndpointControl::ENABLE
                | EndpointControl::TOGGLE_RESET;
            let type_mask = EndpointControl::TYPE_MASK.shifted(direction);
            self.registers().modify(ctrl, |v| (v & !type_mask) | enable.shifted(direction));

            Ok(())
        })?;

        info!(
            "USB DCD{}: opened {:?} endpoint {:#04x} (slot {}, max packet {})",
            self.id().as_u8(),
            transfer_type,
            address.0,
            slot.0,
            descriptor.max_packet_size()
        );

        Ok(EndpointHandle {
            controller: self.id(),
            transfer_type,
            slot,
            class,
        })
    }

    /// パイプをクローズ
    ///
    /// ハードウェアでフラッシュしてから、キュー内の QTD を全て解放し、
    /// エンドポイントの該当方向を無効化する。フラッシュがタイムアウトした
    /// 場合は QTD を解放しない。
    pub fn close_pipe(&self, handle: &EndpointHandle) -> DcdResult<()> {
        self.check_handle(handle)?;
        let slot = handle.slot;
        let mask = slot.mask();

        let released = self.with_pool(|pool| -> DcdResult<usize> {
            if !self.endpoint_control(slot).contains(EndpointControl::ENABLE) {
                return Err(DcdError::NotOpen);
            }

            self.flush_endpoints(mask)?;

            let released = pool.drain(slot);
            self.registers().clear_bits(
                Register::EndptCtrl(slot.logical()),
                EndpointControl::ENABLE.shifted(slot.direction()),
            );
            Ok(released)
        })?;

        info!(
            "USB DCD{}: closed endpoint {:#04x} ({} descriptors released)",
            self.id().as_u8(),
            handle.address().0,
            released
        );
        Ok(())
    }

    // ========================================================================
    // Status / Stall
    // ========================================================================

    /// 転送中か（オーバーレイが Active かつ HALT していない）
    pub fn is_busy(&self, handle: &EndpointHandle) -> bool {
        self.with_pool(|pool| pool.qhd(handle.slot).is_busy())
    }

    /// エンドポイントを STALL させる
    pub fn stall(&self, handle: &EndpointHandle) {
        let _mask = InterruptMask::new(self.registers());
        self.registers().set_bits(
            Register::EndptCtrl(handle.slot.logical()),
            EndpointControl::STALL.shifted(handle.slot.direction()),
        );
        debug!("USB DCD{}: stalled endpoint {:#04x}", self.id().as_u8(), handle.address().0);
    }

    /// STALL 中か
    pub fn is_stalled(&self, handle: &EndpointHandle) -> bool {
        self.endpoint_control(handle.slot).contains(EndpointControl::STALL)
    }

    /// STALL を解除してデータトグルをリセット (CLEAR_FEATURE(ENDPOINT_HALT))
    pub fn clear_stall(&self, handle: &EndpointHandle) {
        let direction = handle.slot.direction();
        let stall = EndpointControl::STALL.shifted(direction);
        let toggle_reset = EndpointControl::TOGGLE_RESET.shifted(direction);

        let _mask = InterruptMask::new(self.registers());
        self.registers().modify(Register::EndptCtrl(handle.slot.logical()), |v| (v & !stall) | toggle_reset);
        debug!("USB DCD{}: cleared stall on endpoint {:#04x}", self.id().as_u8(), handle.address().0);
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// 転送をキューに追加する（プライムしない）
    ///
    /// 中間のチェーン要素は `notify = false` で積み、最後だけ通知を要求する。
    pub fn queue_transfer(&self, handle: &EndpointHandle, buffer: &DmaBuffer, notify: bool) -> DcdResult<()> {
        self.check_handle(handle)?;

        self.with_pool(|pool| {
            if !self.endpoint_control(handle.slot).contains(EndpointControl::ENABLE) {
                return Err(DcdError::NotOpen);
            }
            pool.enqueue(handle.slot, buffer, notify).map(|_| ())
        })
        .inspect_err(|e| self.log_rejected(handle, *e))
    }

    /// 転送をキューに追加し、エンドポイントが動いていなければプライムする
    ///
    /// エンドポイントが既に動いている場合は末尾へのリンクだけで
    /// ハードウェアが続きを処理する。`queue_transfer` で積んだチェーンは
    /// 先頭の Active な QTD からプライムされる。
    ///
    /// 動作中かの確認がタイムアウトした場合、QTD はキューに残したまま
    /// `Timeout` を返す（クローズかバスリセットで回収される）。
    pub fn start_transfer(&self, handle: &EndpointHandle, buffer: &DmaBuffer, notify: bool) -> DcdResult<()> {
        self.check_handle(handle)?;
        let slot = handle.slot;
        let mask = slot.mask();

        self.with_pool(|pool| -> DcdResult<()> {
            if !self.endpoint_control(slot).contains(EndpointControl::ENABLE) {
                return Err(DcdError::NotOpen);
            }
            let index = pool.enqueue(slot, buffer, notify)?;

            // 既存の QTD の後ろに繋いだ場合だけ、ハードウェアが拾うかを確かめる
            let linked = pool.qhd(slot).queue_len() > 1;
            if linked && self.endpoint_running(mask)? {
                debug!("USB DCD{}: qtd {} linked behind running slot {}", self.id().as_u8(), index, slot.0);
                return Ok(());
            }

            let first = pool.first_active(slot).unwrap_or(index);
            let addr = pool.qtd_address(first)?;
            pool.qhd_mut(slot).attach(addr);
            self.registers().write(Register::EndptPrime, mask);

            debug!(
                "USB DCD{}: primed slot {} with qtd {} ({} bytes)",
                self.id().as_u8(),
                slot.0,
                first,
                pool.qtd(first).expected_bytes()
            );
            Ok(())
        })
        .inspect_err(|e| self.log_rejected(handle, *e))
    }

    /// 末尾へのリンク後、エンドポイントがまだ QTD を辿っているか
    ///
    /// プライム中なら動いている。そうでなければ Add dTD Tripwire を立てて
    /// ENDPTSTAT を読み、読んでいる間にハードウェアが dQH を更新して
    /// トリップワイヤを落としたら読み直す。
    fn endpoint_running(&self, mask: u32) -> DcdResult<bool> {
        let regs = self.registers();
        if regs.read(Register::EndptPrime) & mask != 0 {
            return Ok(true);
        }

        let tripwire = UsbCommand::ADD_QTD_TRIPWIRE.bits();
        let mut running = false;
        let sampled = self.wait_for("add-dTD tripwire", |r| {
            r.set_bits(Register::UsbCmd, tripwire);
            running = r.read(Register::EndptStat) & mask != 0;
            r.read(Register::UsbCmd) & tripwire != 0
        });
        regs.clear_bits(Register::UsbCmd, tripwire);

        sampled.map(|()| running)
    }

    fn log_rejected(&self, handle: &EndpointHandle, err: DcdError) {
        if err == DcdError::PoolExhausted {
            warn!("USB DCD{}: endpoint {:#04x}: {}", self.id().as_u8(), handle.address().0, err);
        }
    }
}
