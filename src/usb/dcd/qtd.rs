// ============================================================================
// src/usb/dcd/qtd.rs - Queue Transfer Descriptor (dTD)
// ============================================================================
//!
//! 転送ディスクリプタ (QTD) のハードウェアレイアウトと操作。
//!
//! ## メモリ構造 (32バイト)
//! - Word 0: 次の QTD ポインタ（bit0 = 終端）
//! - Word 1: トークン（ステータス、IOC、残りバイト数）
//! - Word 2-6: バッファページポインタ ×5（2つ目以降は 4KiB 境界）
//! - Word 7: ソフトウェア領域（期待バイト数、使用中フラグ）
//!
//! プライム後はトークンと next をハードウェアが書き換えるため、
//! これらのフィールドは volatile アクセサ経由でのみ読み書きする。

use core::ptr;

use bitflags::bitflags;

use crate::error::{DcdError, DcdResult};

/// 次ポインタの終端値
pub const QTD_NEXT_INVALID: u32 = 0x01;

/// DMA ページサイズ
pub const PAGE_SIZE: u32 = 4096;

/// 1ディスクリプタあたりのページポインタ数
pub const QTD_PAGE_COUNT: usize = 5;

/// トークンの total_bytes フィールドの最大値 (15ビット)
pub const MAX_TRANSFER_BYTES: u16 = 0x7FFF;

const TOKEN_TOTAL_BYTES_SHIFT: u32 = 16;
const TOKEN_TOTAL_BYTES_MASK: u32 = 0x7FFF;

bitflags! {
    /// トークンのステータス/制御ビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenStatus: u32 {
        /// Transaction Error
        const TRANSACTION_ERROR = 1 << 3;
        /// Data Buffer Error
        const BUFFER_ERROR = 1 << 5;
        /// Halted
        const HALTED = 1 << 6;
        /// Active
        const ACTIVE = 1 << 7;
        /// Interrupt On Complete
        const INTERRUPT_ON_COMPLETE = 1 << 15;
    }
}

impl TokenStatus {
    /// 完了時にエラーと判定するビット
    pub const ERROR_MASK: Self = Self::TRANSACTION_ERROR
        .union(Self::HALTED)
        .union(Self::BUFFER_ERROR);
}

// ============================================================================
// DMA Address / Buffer
// ============================================================================

/// コントローラから見たバスアドレス
///
/// コントローラは 32 ビットのバスマスタであり、ディスクリプタと
/// バッファは 32 ビットアドレス空間に置かれる前提。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaAddr(pub u32);

impl DmaAddr {
    /// CPU アドレスとバスアドレスが一致する場合の変換
    ///
    /// 32 ビットに収まらなければ `None`。
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::translate(ptr as usize, 0)
    }

    /// `bus = cpu - offset` で変換
    pub fn translate(cpu: usize, offset: usize) -> Option<Self> {
        let bus = cpu.checked_sub(offset)?;
        u32::try_from(bus).ok().map(Self)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// 4KiB ページ内オフセット
    pub fn page_offset(&self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// 4KiB ページ先頭
    pub fn page_base(&self) -> u32 {
        self.0 & !(PAGE_SIZE - 1)
    }
}

/// DMA バッファ
///
/// ディスクリプタが参照するバッファの位置と長さ。ハードウェアが完了するまで
/// 参照先は有効でなければならないため、構築は `'static` バッファか
/// unsafe な生ポインタからのみ行う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    addr: Option<DmaAddr>,
    len: u16,
}

impl DmaBuffer {
    /// 長さ0（ステータスステージ等）
    pub const EMPTY: Self = Self { addr: None, len: 0 };

    /// `'static` バッファから作成
    pub fn from_static(buffer: &'static mut [u8]) -> DcdResult<Self> {
        // SAFETY: 'static な排他参照なので転送完了まで有効
        unsafe { Self::from_raw_parts(buffer.as_mut_ptr(), buffer.len()) }
    }

    /// 生ポインタから作成
    ///
    /// # Safety
    /// `ptr` から `len` バイトは、このバッファを使う転送が完了（または
    /// パイプのクローズ/バスリセット）するまで有効で、他から触られないこと。
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> DcdResult<Self> {
        if len == 0 {
            return Ok(Self::EMPTY);
        }
        if len > MAX_TRANSFER_BYTES as usize {
            return Err(DcdError::TransferTooLarge);
        }

        let addr = DmaAddr::from_ptr(ptr).ok_or(DcdError::DmaOutOfRange)?;
        // 最終バイトまで 32 ビット空間に収まること
        if addr.0.checked_add(len as u32 - 1).is_none() {
            return Err(DcdError::DmaOutOfRange);
        }
        // 先頭ページ内オフセット + 長さが 5 ページに収まること
        let window = (QTD_PAGE_COUNT as u32) * PAGE_SIZE;
        if addr.page_offset() + len as u32 > window {
            return Err(DcdError::TransferTooLarge);
        }

        Ok(Self {
            addr: Some(addr),
            len: len as u16,
        })
    }

    pub fn addr(&self) -> Option<DmaAddr> {
        self.addr
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ============================================================================
// Transfer Descriptor
// ============================================================================

/// 転送ディスクリプタ (dTD)
#[repr(C)]
pub struct TransferDescriptor {
    /// 次の QTD（ハードウェアが辿る）
    next: u32,
    /// トークン（ハードウェアが書き換える）
    token: u32,
    /// バッファページポインタ
    buffer: [u32; QTD_PAGE_COUNT],
    /// 期待バイト数（ソフトウェア領域）
    expected_bytes: u16,
    /// 使用中フラグ（ソフトウェア領域）
    used: u8,
    _reserved: u8,
}

const _: () = assert!(core::mem::size_of::<TransferDescriptor>() == 32);

impl TransferDescriptor {
    /// ゼロクリア状態
    pub const EMPTY: Self = Self {
        next: 0,
        token: 0,
        buffer: [0; QTD_PAGE_COUNT],
        expected_bytes: 0,
        used: 0,
        _reserved: 0,
    };

    /// 全フィールドをゼロクリア
    pub fn clear(&mut self) {
        // SAFETY: &mut self は有効で整列済み
        unsafe { ptr::write_volatile(self, Self::EMPTY) }
    }

    /// 転送用に初期化
    ///
    /// used = 1, next = 終端, active = 1, expected = remaining = len。
    /// バッファがあれば 4KiB 境界ごとにページポインタを埋める。
    pub fn init(&mut self, buffer: &DmaBuffer) {
        self.clear();

        self.used = 1;
        self.expected_bytes = buffer.len();
        self.write_next(QTD_NEXT_INVALID);
        self.write_token(TokenStatus::ACTIVE.bits() | ((buffer.len() as u32) << TOKEN_TOTAL_BYTES_SHIFT));

        if let Some(addr) = buffer.addr() {
            let mut page = addr.as_u32();
            self.buffer[0] = page;
            for i in 1..QTD_PAGE_COUNT {
                page = (page & !(PAGE_SIZE - 1)).wrapping_add(PAGE_SIZE);
                self.buffer[i] = page;
            }
        }
    }

    /// 使用中?
    pub fn is_used(&self) -> bool {
        self.used != 0
    }

    /// 使用中にする
    pub fn mark_used(&mut self) {
        self.used = 1;
    }

    /// 解放（完了ディスパッチャからのみ呼ぶ）
    pub fn release(&mut self) {
        self.used = 0;
    }

    /// 次ポインタを読み取り
    pub fn next(&self) -> u32 {
        // SAFETY: &self は有効で整列済み
        unsafe { ptr::read_volatile(&self.next) }
    }

    /// 次ポインタを書き込み
    pub fn write_next(&mut self, next: u32) {
        // SAFETY: 同上
        unsafe { ptr::write_volatile(&mut self.next, next) }
    }

    /// 次の QTD へリンク
    pub fn link(&mut self, next: DmaAddr) {
        self.write_next(next.as_u32());
    }

    /// トークンを読み取り
    pub fn token(&self) -> u32 {
        // SAFETY: 同上
        unsafe { ptr::read_volatile(&self.token) }
    }

    /// トークンを書き込み
    pub fn write_token(&mut self, token: u32) {
        // SAFETY: 同上
        unsafe { ptr::write_volatile(&mut self.token, token) }
    }

    /// ステータスビット
    pub fn status(&self) -> TokenStatus {
        TokenStatus::from_bits_truncate(self.token())
    }

    /// ハードウェアが処理中?
    pub fn is_active(&self) -> bool {
        self.status().contains(TokenStatus::ACTIVE)
    }

    /// エラーで終了した?
    pub fn has_error(&self) -> bool {
        self.status().intersects(TokenStatus::ERROR_MASK)
    }

    /// 完了時に割り込みを要求するか
    pub fn interrupt_on_complete(&self) -> bool {
        self.status().contains(TokenStatus::INTERRUPT_ON_COMPLETE)
    }

    /// 完了割り込みの要求を設定
    pub fn set_interrupt_on_complete(&mut self, enable: bool) {
        let token = self.token();
        let ioc = TokenStatus::INTERRUPT_ON_COMPLETE.bits();
        self.write_token(if enable { token | ioc } else { token & !ioc });
    }

    /// Active ビットをクリア（フラッシュ後のソフトウェア側の整合）
    pub fn clear_active(&mut self) {
        let token = self.token();
        self.write_token(token & !TokenStatus::ACTIVE.bits());
    }

    /// 残りバイト数
    pub fn remaining_bytes(&self) -> u16 {
        ((self.token() >> TOKEN_TOTAL_BYTES_SHIFT) & TOKEN_TOTAL_BYTES_MASK) as u16
    }

    /// 期待バイト数
    pub fn expected_bytes(&self) -> u16 {
        self.expected_bytes
    }

    /// 実際に転送されたバイト数
    pub fn transferred_bytes(&self) -> u16 {
        self.expected_bytes.saturating_sub(self.remaining_bytes())
    }

    /// ページポインタ
    pub fn page_pointer(&self, index: usize) -> u32 {
        self.buffer[index]
    }

    /// ハードウェアによる完了を模擬（テスト用）
    #[cfg(test)]
    pub(crate) fn complete(&mut self, remaining: u16, errors: TokenStatus) {
        let keep = self.token() & TokenStatus::INTERRUPT_ON_COMPLETE.bits();
        self.write_token(
            keep | (errors & TokenStatus::ERROR_MASK).bits()
                | ((remaining as u32 & TOKEN_TOTAL_BYTES_MASK) << TOKEN_TOTAL_BYTES_SHIFT),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_buffer(addr: u32, len: usize) -> DmaBuffer {
        unsafe { DmaBuffer::from_raw_parts(addr as usize as *mut u8, len).unwrap() }
    }

    #[test]
    fn test_init_counts() {
        let mut qtd = TransferDescriptor::EMPTY;
        qtd.init(&raw_buffer(0x2000_0100, 512));
        assert!(qtd.is_used());
        assert!(qtd.is_active());
        assert_eq!(qtd.expected_bytes(), 512);
        assert_eq!(qtd.remaining_bytes(), 512);
        assert_eq!(qtd.next(), QTD_NEXT_INVALID);
    }

    #[test]
    fn test_init_zero_length_has_no_pages() {
        let mut qtd = TransferDescriptor::EMPTY;
        qtd.init(&DmaBuffer::EMPTY);
        assert_eq!(qtd.expected_bytes(), 0);
        assert_eq!(qtd.remaining_bytes(), 0);
        for i in 0..QTD_PAGE_COUNT {
            assert_eq!(qtd.page_pointer(i), 0);
        }
    }

    #[test]
    fn test_page_pointers_on_4k_boundaries() {
        let mut qtd = TransferDescriptor::EMPTY;
        qtd.init(&raw_buffer(0x2000_0F80, 1024));
        assert_eq!(qtd.page_pointer(0), 0x2000_0F80);
        assert_eq!(qtd.page_pointer(1), 0x2000_1000);
        assert_eq!(qtd.page_pointer(2), 0x2000_2000);
        assert_eq!(qtd.page_pointer(4), 0x2000_4000);
    }

    #[test]
    fn test_buffer_limits() {
        let too_long = unsafe { DmaBuffer::from_raw_parts(0x2000_0000 as *mut u8, 0x8000) };
        assert_eq!(too_long, Err(DcdError::TransferTooLarge));

        // 先頭オフセットのせいで 5 ページを越える
        let spill = unsafe { DmaBuffer::from_raw_parts(0x2000_0FFF as *mut u8, 0x7FFF) };
        assert_eq!(spill, Err(DcdError::TransferTooLarge));

        let empty = unsafe { DmaBuffer::from_raw_parts(core::ptr::null_mut(), 0) };
        assert_eq!(empty, Ok(DmaBuffer::EMPTY));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_buffer_above_4g_is_rejected() {
        let high = unsafe { DmaBuffer::from_raw_parts(0x1_2000_0000usize as *mut u8, 64) };
        assert_eq!(high, Err(DcdError::DmaOutOfRange));
        assert_eq!(DmaAddr::from_ptr(0x1_0000_0000usize as *const u8), None);
    }

    #[test]
    fn test_buffer_must_end_below_4g() {
        // 先頭は収まるが末尾が 32 ビットを越える
        let wrap = unsafe { DmaBuffer::from_raw_parts(0xFFFF_FFC0usize as *mut u8, 128) };
        assert_eq!(wrap, Err(DcdError::DmaOutOfRange));

        let last = unsafe { DmaBuffer::from_raw_parts(0xFFFF_FFC0usize as *mut u8, 64) };
        assert_eq!(last.map(|b| b.addr()), Ok(Some(DmaAddr(0xFFFF_FFC0))));
    }

    #[test]
    fn test_translate_with_offset() {
        assert_eq!(DmaAddr::translate(0x8000_2000, 0x8000_0000), Some(DmaAddr(0x2000)));
        assert_eq!(DmaAddr::translate(0x1000, 0x2000), None);
    }

    #[test]
    fn test_completion_classification() {
        let mut qtd = TransferDescriptor::EMPTY;
        qtd.init(&raw_buffer(0x2000_0000, 64));
        qtd.set_interrupt_on_complete(true);

        qtd.complete(16, TokenStatus::empty());
        assert!(!qtd.is_active());
        assert!(!qtd.has_error());
        assert!(qtd.interrupt_on_complete());
        assert_eq!(qtd.transferred_bytes(), 48);

        qtd.complete(64, TokenStatus::HALTED);
        assert!(qtd.has_error());
    }

    #[test]
    fn test_release() {
        let mut qtd = TransferDescriptor::EMPTY;
        qtd.init(&DmaBuffer::EMPTY);
        qtd.release();
        assert!(!qtd.is_used());
    }
}
