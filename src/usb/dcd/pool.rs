// ============================================================================
// src/usb/dcd/pool.rs - Descriptor Pool
// ============================================================================
//!
//! QHD/QTD の固定長プール。
//!
//! ## 設計
//! - コントローラインスタンスごとに1つ。バスリセットで丸ごと再初期化
//! - QTD 0/1 はコントロール転送専用（データ/ステータス）で、汎用の確保対象外
//! - 確保は昇順の線形探索。公平性は考慮しない
//! - 解放は完了ディスパッチャ（とクローズ/リセット）のみが行い、
//!   ハードウェアが辿っている可能性のある QTD をフォアグラウンドが解放しない
//!
//! ハードウェアは QHD 配列の先頭を ENDPOINTLISTADDR で参照するため、
//! テーブル全体を 2KiB 境界に置く。バスアドレスは CPU アドレスから
//! 固定オフセットを引いたもので、32 ビットに収まらなければ
//! `DmaOutOfRange` になる。

use super::endpoint::{MAX_SLOTS, PhysicalSlot};
use super::qhd::QueueHead;
use super::qtd::{DmaAddr, DmaBuffer, TransferDescriptor};
use crate::error::{DcdError, DcdResult};

/// QTD の総数
pub const QTD_MAX: usize = 12;

/// コントロールのデータフェーズ用 QTD
pub const CONTROL_DATA_QTD: usize = 0;

/// コントロールのステータスフェーズ用 QTD
pub const CONTROL_STATUS_QTD: usize = 1;

/// 汎用確保の開始インデックス
pub const FIRST_POOL_QTD: usize = 2;

/// ハードウェアから見えるディスクリプタテーブル
#[repr(C, align(2048))]
struct DescriptorTable {
    qhd: [QueueHead; MAX_SLOTS],
    qtd: [TransferDescriptor; QTD_MAX],
}

const _: () = assert!(core::mem::offset_of!(DescriptorTable, qtd) % 32 == 0);

/// 回収された QTD の情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredDescriptor {
    /// QTD インデックス
    pub qtd_index: usize,
    /// 完了通知が必要か
    pub notify: bool,
    /// エラー終了か
    pub error: bool,
    /// 転送バイト数（期待 - 残り）
    pub transferred: u16,
}

/// ディスクリプタプール
pub struct DescriptorPool {
    table: DescriptorTable,
    /// CPU アドレス - バスアドレス
    bus_offset: usize,
}

impl DescriptorPool {
    /// 空のプールを作成
    pub const fn new(bus_offset: usize) -> Self {
        Self {
            table: DescriptorTable {
                qhd: [QueueHead::EMPTY; MAX_SLOTS],
                qtd: [TransferDescriptor::EMPTY; QTD_MAX],
            },
            bus_offset,
        }
    }

    // ------------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------------

    fn bus_address<T>(&self, ptr: *const T) -> DcdResult<DmaAddr> {
        DmaAddr::translate(ptr as usize, self.bus_offset).ok_or(DcdError::DmaOutOfRange)
    }

    /// QHD 配列の先頭アドレス（ENDPOINTLISTADDR 用）
    pub fn queue_head_list_address(&self) -> DcdResult<DmaAddr> {
        self.bus_address(self.table.qhd.as_ptr())
    }

    /// QTD のバスアドレス
    pub fn qtd_address(&self, index: usize) -> DcdResult<DmaAddr> {
        self.bus_address(&self.table.qtd[index])
    }

    /// テーブルが置かれた 4GiB 窓をバス空間とみなす（ホスト上のテスト用）
    #[cfg(test)]
    pub(crate) fn map_into_bus_window(&mut self) {
        self.bus_offset = (&self.table as *const DescriptorTable as usize) & !(u32::MAX as usize);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn qhd(&self, slot: PhysicalSlot) -> &QueueHead {
        &self.table.qhd[slot.as_usize()]
    }

    pub fn qhd_mut(&mut self, slot: PhysicalSlot) -> &mut QueueHead {
        &mut self.table.qhd[slot.as_usize()]
    }

    pub fn qtd(&self, index: usize) -> &TransferDescriptor {
        &self.table.qtd[index]
    }

    pub fn qtd_mut(&mut self, index: usize) -> &mut TransferDescriptor {
        &mut self.table.qtd[index]
    }

    /// 汎用 QTD の空き数
    pub fn free_count(&self) -> usize {
        self.table.qtd[FIRST_POOL_QTD..].iter().filter(|qtd| !qtd.is_used()).count()
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    fn find_free(&self) -> Option<usize> {
        (FIRST_POOL_QTD..QTD_MAX).find(|&i| !self.table.qtd[i].is_used())
    }

    /// 空き QTD を確保（ゼロクリアして使用中にする）
    pub fn allocate(&mut self) -> DcdResult<usize> {
        let index = self.find_free().ok_or(DcdError::PoolExhausted)?;
        let qtd = &mut self.table.qtd[index];
        qtd.clear();
        qtd.mark_used();
        Ok(index)
    }

    /// QTD を転送用に初期化
    pub fn init_descriptor(&mut self, index: usize, buffer: &DmaBuffer) {
        self.table.qtd[index].init(buffer);
    }

    /// QTD を解放
    pub fn release(&mut self, index: usize) {
        self.table.qtd[index].release();
    }

    // ------------------------------------------------------------------------
    // Outstanding-transfer queue
    // ------------------------------------------------------------------------

    /// QTD を確保して QHD のキュー末尾に追加する（プライムはしない）
    ///
    /// 空き QTD、キューの空き、リンク先アドレスを全て確認してから
    /// 変更するため、失敗時にプールは変化しない。
    pub fn enqueue(&mut self, slot: PhysicalSlot, buffer: &DmaBuffer, notify: bool) -> DcdResult<usize> {
        let index = self.find_free().ok_or(DcdError::PoolExhausted)?;
        let qhd = &self.table.qhd[slot.as_usize()];
        if qhd.queue_is_full() {
            return Err(DcdError::PoolExhausted);
        }
        let tail = qhd.queue_tail();
        let addr = self.qtd_address(index)?;

        let qtd = &mut self.table.qtd[index];
        qtd.init(buffer);
        qtd.set_interrupt_on_complete(notify);

        // 新しい QTD を書き終えてから前の QTD の next に繋ぐ
        if let Some(tail) = tail {
            self.table.qtd[tail].link(addr);
        }
        self.table.qhd[slot.as_usize()].push_queue(index)?;

        Ok(index)
    }

    /// キュー内で最初に Active な QTD
    pub fn first_active(&self, slot: PhysicalSlot) -> Option<usize> {
        self.qhd(slot).queued().find(|&i| self.table.qtd[i].is_active())
    }

    /// キュー先頭から非 Active な QTD を順に回収する
    ///
    /// 最初の Active な QTD で止まる（ハードウェアが後続をまだ処理していない）。
    /// 回収順はキューへの追加順。
    pub fn retire<F: FnMut(RetiredDescriptor)>(&mut self, slot: PhysicalSlot, mut on_retired: F) -> usize {
        let mut retired = 0;
        while let Some(index) = self.qhd(slot).queue_head() {
            let qtd = &mut self.table.qtd[index];
            if qtd.is_active() {
                break;
            }

            qtd.release();
            let info = RetiredDescriptor {
                qtd_index: index,
                notify: qtd.interrupt_on_complete(),
                error: qtd.has_error(),
                transferred: qtd.transferred_bytes(),
            };
            self.table.qhd[slot.as_usize()].pop_queue();
            retired += 1;
            on_retired(info);
        }
        retired
    }

    /// キュー内の QTD を状態に関係なく全て解放する（フラッシュ後のみ）
    pub fn drain(&mut self, slot: PhysicalSlot) -> usize {
        let mut drained = 0;
        while let Some(index) = self.table.qhd[slot.as_usize()].pop_queue() {
            self.table.qtd[index].release();
            drained += 1;
        }
        let qhd = &mut self.table.qhd[slot.as_usize()];
        qhd.clear_active();
        qhd.detach();
        drained
    }

    // ------------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------------

    /// プール全体をゼロクリアし、コントロール QHD を再設定する
    pub fn reset(&mut self, control_max_packet_size: u16) {
        for qhd in self.table.qhd.iter_mut() {
            qhd.clear();
        }
        for qtd in self.table.qtd.iter_mut() {
            qtd.clear();
        }

        // Interrupt On Setup は OUT 側のみ
        self.qhd_mut(PhysicalSlot::CONTROL_OUT).configure(control_max_packet_size, true, true);
        self.qhd_mut(PhysicalSlot::CONTROL_IN).configure(control_max_packet_size, true, false);
    }
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new(0)
    }
}
