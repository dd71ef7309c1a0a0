// ============================================================================
// src/usb/dcd/regs.rs - Device Controller Register Definitions
// ============================================================================
//!
//! デバイスモード USB コアのレジスタ定義。
//!
//! ChipIdea 系 (LPC43xx, i.MX RT 等) のデバイスモードレジスタ配置に基づく。
//! ビットフィールドは言語の構造体レイアウトに依存しないよう、
//! 整数上のマスクとアクセサで表現する。

use core::ptr;

use bitflags::bitflags;

use crate::usb::TransferDirection;

// ============================================================================
// Register Offsets
// ============================================================================

/// レジスタオフセット（コアレジスタブロック先頭から）
pub mod offsets {
    /// USB Command - RW
    pub const USBCMD: usize = 0x140;
    /// USB Status - RW1C
    pub const USBSTS: usize = 0x144;
    /// USB Interrupt Enable - RW
    pub const USBINTR: usize = 0x148;
    /// Device Address - RW
    pub const DEVICEADDR: usize = 0x154;
    /// Endpoint List Address (dQH 配列の先頭) - RW
    pub const ENDPOINTLISTADDR: usize = 0x158;
    /// Endpoint NAK - RW1C
    pub const ENDPTNAK: usize = 0x178;
    /// Endpoint NAK Enable - RW
    pub const ENDPTNAKEN: usize = 0x17C;
    /// USB Mode - RW
    pub const USBMODE: usize = 0x1A8;
    /// Endpoint Setup Status - RW1C
    pub const ENDPTSETUPSTAT: usize = 0x1AC;
    /// Endpoint Prime - RWS (ハードウェアがクリア)
    pub const ENDPTPRIME: usize = 0x1B0;
    /// Endpoint Flush - RWS (ハードウェアがクリア)
    pub const ENDPTFLUSH: usize = 0x1B4;
    /// Endpoint Status - RO
    pub const ENDPTSTAT: usize = 0x1B8;
    /// Endpoint Complete - RW1C
    pub const ENDPTCOMPLETE: usize = 0x1BC;
    /// Endpoint Control 0 (以降 4 バイト間隔)
    pub const ENDPTCTRL0: usize = 0x1C0;
}

/// レジスタ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    UsbCmd,
    UsbSts,
    UsbIntr,
    DeviceAddr,
    EndpointListAddr,
    EndptNak,
    EndptNakEn,
    UsbMode,
    EndptSetupStat,
    EndptPrime,
    EndptFlush,
    EndptStat,
    EndptComplete,
    /// 論理エンドポイント番号ごとの制御レジスタ
    EndptCtrl(u8),
}

impl Register {
    /// コアレジスタブロック先頭からのオフセット
    pub const fn offset(self) -> usize {
        match self {
            Register::UsbCmd => offsets::USBCMD,
            Register::UsbSts => offsets::USBSTS,
            Register::UsbIntr => offsets::USBINTR,
            Register::DeviceAddr => offsets::DEVICEADDR,
            Register::EndpointListAddr => offsets::ENDPOINTLISTADDR,
            Register::EndptNak => offsets::ENDPTNAK,
            Register::EndptNakEn => offsets::ENDPTNAKEN,
            Register::UsbMode => offsets::USBMODE,
            Register::EndptSetupStat => offsets::ENDPTSETUPSTAT,
            Register::EndptPrime => offsets::ENDPTPRIME,
            Register::EndptFlush => offsets::ENDPTFLUSH,
            Register::EndptStat => offsets::ENDPTSTAT,
            Register::EndptComplete => offsets::ENDPTCOMPLETE,
            Register::EndptCtrl(n) => offsets::ENDPTCTRL0 + 4 * n as usize,
        }
    }
}

// ============================================================================
// Register Bits
// ============================================================================

bitflags! {
    /// USBCMD
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCommand: u32 {
        /// Run/Stop
        const RUN_STOP = 1 << 0;
        /// Controller Reset（完了するとハードウェアがクリア）
        const RESET = 1 << 1;
        /// Add dTD Tripwire（ハードウェアが dQH を更新するとクリア）
        const ADD_QTD_TRIPWIRE = 1 << 14;
    }
}

impl UsbCommand {
    /// Interrupt Threshold Control (bits 16:23)
    pub const ITC_MASK: u32 = 0x00FF_0000;
}

bitflags! {
    /// USBSTS / USBINTR の割り込みビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptFlags: u32 {
        /// USB Interrupt（転送完了/セットアップ受信）
        const USB = 1 << 0;
        /// USB Error Interrupt
        const ERROR = 1 << 1;
        /// Port Change Detect
        const PORT_CHANGE = 1 << 2;
        /// USB Reset Received
        const RESET = 1 << 6;
        /// SOF Received
        const SOF = 1 << 7;
        /// DC Suspend
        const SUSPEND = 1 << 8;
        /// NAK Interrupt
        const NAK = 1 << 16;
    }
}

impl InterruptFlags {
    /// 初期化時に有効化する割り込み
    pub const DEFAULT_ENABLED: Self = Self::USB
        .union(Self::ERROR)
        .union(Self::PORT_CHANGE)
        .union(Self::RESET)
        .union(Self::SUSPEND);
}

bitflags! {
    /// ENDPTCTRLn の片方向ハーフ (RX = bits 0:15, TX = bits 16:31)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndpointControl: u32 {
        /// Endpoint Stall
        const STALL = 1 << 0;
        /// Endpoint Type (2ビット)
        const TYPE_MASK = 0b11 << 2;
        /// Data Toggle Reset
        const TOGGLE_RESET = 1 << 6;
        /// Endpoint Enable
        const ENABLE = 1 << 7;
    }
}

impl EndpointControl {
    /// エンドポイントタイプフィールドの値
    pub const fn with_type(transfer_type: u8) -> Self {
        Self::from_bits_truncate(((transfer_type & 0b11) as u32) << 2)
    }

    /// 方向に応じたハーフへシフトしたレジスタ値
    pub fn shifted(self, direction: TransferDirection) -> u32 {
        self.bits() << Self::shift(direction)
    }

    /// レジスタ値から指定方向のハーフを取り出す
    pub fn from_register(value: u32, direction: TransferDirection) -> Self {
        Self::from_bits_truncate(value >> Self::shift(direction))
    }

    fn shift(direction: TransferDirection) -> u32 {
        match direction {
            TransferDirection::Out => 0,
            TransferDirection::In => 16,
        }
    }
}

/// DEVICEADDR: USBADR (bits 25:31)
pub const DEVICEADDR_SHIFT: u32 = 25;
/// DEVICEADDR: USBADRA（ステータスステージ完了後にアドレスを適用）
pub const DEVICEADDR_ADVANCE: u32 = 1 << 24;

/// USBMODE: Controller Mode = Device
pub const USBMODE_CM_DEVICE: u32 = 0b10;
/// USBMODE: Setup Lockout Off
pub const USBMODE_SLOM: u32 = 1 << 3;

/// 全エンドポイントのフラッシュ
pub const FLUSH_ALL: u32 = 0xFFFF_FFFF;

// ============================================================================
// Register Access
// ============================================================================

/// レジスタアクセストレイト
///
/// MMIO の実装は [`MmioRegisters`]。テストではハードウェアモデルが実装する。
pub trait RegisterAccess {
    /// レジスタを読み取り
    fn read(&self, reg: Register) -> u32;

    /// レジスタに書き込み
    fn write(&self, reg: Register, value: u32);

    /// 読み取り-変更-書き込み（書き込みは1回）
    fn modify<F: FnOnce(u32) -> u32>(&self, reg: Register, f: F) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }

    /// ビットをセット
    fn set_bits(&self, reg: Register, bits: u32) {
        self.modify(reg, |v| v | bits);
    }

    /// ビットをクリア
    fn clear_bits(&self, reg: Register, bits: u32) {
        self.modify(reg, |v| v & !bits);
    }

    /// 読んだ値をそのまま書き戻す（RW1C レジスタの全クリア）
    fn write_back(&self, reg: Register) -> u32 {
        let value = self.read(reg);
        self.write(reg, value);
        value
    }
}

/// MMIO レジスタブロック
pub struct MmioRegisters {
    /// コアレジスタブロックの仮想アドレス
    base: usize,
}

impl MmioRegisters {
    /// MMIO レジスタブロックを作成
    ///
    /// # Safety
    /// `base` はマップ済みの USB コアレジスタブロックを指し、
    /// このインスタンスだけがそのブロックを操作すること。
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read(&self, reg: Register) -> u32 {
        // SAFETY: new() の契約によりベースアドレスは有効なレジスタブロック
        unsafe { ptr::read_volatile((self.base + reg.offset()) as *const u32) }
    }

    fn write(&self, reg: Register, value: u32) {
        // SAFETY: 同上
        unsafe { ptr::write_volatile((self.base + reg.offset()) as *mut u32, value) }
    }
}

// ============================================================================
// Interrupt Mask Guard
// ============================================================================

/// 割り込みマスクガード
///
/// フォアグラウンドのクリティカルセクションの間、コントローラの割り込みを
/// USBINTR でマスクし、ドロップ時に元の値へ戻す。シングルコアでは
/// 割り込みサービスがプールのロック保持者と競合しなくなる。
pub struct InterruptMask<'a, R: RegisterAccess> {
    regs: &'a R,
    saved: u32,
}

impl<'a, R: RegisterAccess> InterruptMask<'a, R> {
    pub fn new(regs: &'a R) -> Self {
        let saved = regs.read(Register::UsbIntr);
        if saved != 0 {
            regs.write(Register::UsbIntr, 0);
        }
        Self { regs, saved }
    }
}

impl<R: RegisterAccess> Drop for InterruptMask<'_, R> {
    fn drop(&mut self) {
        if self.saved != 0 {
            self.regs.write(Register::UsbIntr, self.saved);
        }
    }
}
