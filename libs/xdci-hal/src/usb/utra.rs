//! DesignWare xDCI register map. Offsets are in bytes from the controller MMIO base.

use super::compat::{Field, Register};

/// Stride of the per-interrupt-line event buffer register bank
pub const GEVNT_STRIDE: usize = 0x10;
/// Stride of the per-physical-endpoint command register bank
pub const DEP_STRIDE: usize = 0x10;
/// Stride of the per-port PHY configuration registers
pub const PHY_STRIDE: usize = 0x4;

pub const GSBUSCFG0: Register = Register::new(0xC100, 0xFFFF_FFFF);

pub const GCTL: Register = Register::new(0xC110, 0xFFFF_FFFF);
pub const GCTL_DSBLCLKGTNG: Field = Field::new(1, 0, GCTL);
pub const GCTL_GBLHIBERNATIONEN: Field = Field::new(1, 1, GCTL);
pub const GCTL_U2EXIT_LFPS: Field = Field::new(1, 2, GCTL);
pub const GCTL_DISSCRAMBLE: Field = Field::new(1, 3, GCTL);
pub const GCTL_SCALEDOWN: Field = Field::new(2, 4, GCTL);
pub const GCTL_RAMCLKSEL: Field = Field::new(2, 6, GCTL);
pub const GCTL_PRTCAPDIR: Field = Field::new(2, 12, GCTL);
pub const GCTL_CORESOFTRESET: Field = Field::new(1, 11, GCTL);

pub const GSTS: Register = Register::new(0xC118, 0xFFFF_FFFF);
pub const GSTS_CURMOD: Field = Field::new(2, 0, GSTS);

pub const GSNPSID: Register = Register::new(0xC120, 0xFFFF_FFFF);

pub const GHWPARAMS1: Register = Register::new(0xC144, 0xFFFF_FFFF);
pub const GHWPARAMS1_NUM_INT: Field = Field::new(6, 15, GHWPARAMS1);

pub const GHWPARAMS3: Register = Register::new(0xC14C, 0xFFFF_FFFF);
pub const GHWPARAMS3_NUM_EPS: Field = Field::new(6, 12, GHWPARAMS3);

pub const GUSB2PHYCFG: Register = Register::new(0xC200, 0xFFFF_FFFF);
pub const GUSB2PHYCFG_SUSPHY: Field = Field::new(1, 6, GUSB2PHYCFG);

pub const GUSB3PIPECTL: Register = Register::new(0xC2C0, 0xFFFF_FFFF);
pub const GUSB3PIPECTL_SUSPHY: Field = Field::new(1, 17, GUSB3PIPECTL);

pub const GEVNTADRLO: Register = Register::new(0xC400, 0xFFFF_FFFF);
pub const GEVNTADRHI: Register = Register::new(0xC404, 0xFFFF_FFFF);
pub const GEVNTSIZ: Register = Register::new(0xC408, 0xFFFF_FFFF);
pub const GEVNTSIZ_SIZE: Field = Field::new(16, 0, GEVNTSIZ);
pub const GEVNTSIZ_INTMASK: Field = Field::new(1, 31, GEVNTSIZ);
pub const GEVNTCOUNT: Register = Register::new(0xC40C, 0xFFFF);
pub const GEVNTCOUNT_COUNT: Field = Field::new(16, 0, GEVNTCOUNT);

pub const DCFG: Register = Register::new(0xC700, 0xFFFF_FFFF);
pub const DCFG_DEVSPD: Field = Field::new(3, 0, DCFG);
pub const DCFG_DEVADDR: Field = Field::new(7, 3, DCFG);
pub const DCFG_INTRNUM: Field = Field::new(5, 12, DCFG);
pub const DCFG_NUMP: Field = Field::new(5, 17, DCFG);
pub const DCFG_LPMCAP: Field = Field::new(1, 22, DCFG);

pub const DCTL: Register = Register::new(0xC704, 0xFFFF_FFFF);
pub const DCTL_TSTCTL: Field = Field::new(4, 1, DCTL);
pub const DCTL_ULSTCHNGREQ: Field = Field::new(4, 5, DCTL);
pub const DCTL_ACCEPTU1ENA: Field = Field::new(1, 9, DCTL);
pub const DCTL_INITU1ENA: Field = Field::new(1, 10, DCTL);
pub const DCTL_ACCEPTU2ENA: Field = Field::new(1, 11, DCTL);
pub const DCTL_INITU2ENA: Field = Field::new(1, 12, DCTL);
pub const DCTL_KEEP_CONNECT: Field = Field::new(1, 19, DCTL);
pub const DCTL_CSFTRST: Field = Field::new(1, 30, DCTL);
pub const DCTL_RUN_STOP: Field = Field::new(1, 31, DCTL);

pub const DEVTEN: Register = Register::new(0xC708, 0xFFFF_FFFF);
pub const DEVTEN_DISCONNEVTEN: Field = Field::new(1, 0, DEVTEN);
pub const DEVTEN_USBRSTEVTEN: Field = Field::new(1, 1, DEVTEN);
pub const DEVTEN_CONNECTDONEEVTEN: Field = Field::new(1, 2, DEVTEN);
pub const DEVTEN_ULSTCNGEN: Field = Field::new(1, 3, DEVTEN);
pub const DEVTEN_WKUPEVTEN: Field = Field::new(1, 4, DEVTEN);
pub const DEVTEN_HIBERNATIONREQEVTEN: Field = Field::new(1, 5, DEVTEN);
pub const DEVTEN_U3L2L1SUSPEN: Field = Field::new(1, 6, DEVTEN);
pub const DEVTEN_SOFEVTEN: Field = Field::new(1, 7, DEVTEN);
pub const DEVTEN_ERRTICERREVTEN: Field = Field::new(1, 9, DEVTEN);
pub const DEVTEN_CMDCMPLTEN: Field = Field::new(1, 10, DEVTEN);
pub const DEVTEN_EVNTOVERFLOWEN: Field = Field::new(1, 11, DEVTEN);
pub const DEVTEN_VNDRDEVTSTRCVEDEN: Field = Field::new(1, 12, DEVTEN);

pub const DSTS: Register = Register::new(0xC70C, 0xFFFF_FFFF);
pub const DSTS_CONNECTSPD: Field = Field::new(3, 0, DSTS);
pub const DSTS_SOFFN: Field = Field::new(14, 3, DSTS);
pub const DSTS_RXFIFOEMPTY: Field = Field::new(1, 17, DSTS);
pub const DSTS_USBLNKST: Field = Field::new(4, 18, DSTS);
pub const DSTS_DEVCTRLHLT: Field = Field::new(1, 22, DSTS);
pub const DSTS_COREIDLE: Field = Field::new(1, 23, DSTS);

pub const DGCMDPAR: Register = Register::new(0xC710, 0xFFFF_FFFF);
pub const DGCMD: Register = Register::new(0xC714, 0xFFFF_FFFF);
pub const DGCMD_CMDTYP: Field = Field::new(8, 0, DGCMD);
pub const DGCMD_CMDIOC: Field = Field::new(1, 8, DGCMD);
pub const DGCMD_CMDACT: Field = Field::new(1, 10, DGCMD);
pub const DGCMD_CMDSTATUS: Field = Field::new(1, 15, DGCMD);

pub const DALEPENA: Register = Register::new(0xC720, 0xFFFF_FFFF);

pub const DEPCMDPAR2: Register = Register::new(0xC800, 0xFFFF_FFFF);
pub const DEPCMDPAR1: Register = Register::new(0xC804, 0xFFFF_FFFF);
pub const DEPCMDPAR0: Register = Register::new(0xC808, 0xFFFF_FFFF);
pub const DEPCMD: Register = Register::new(0xC80C, 0xFFFF_FFFF);
pub const DEPCMD_CMDTYP: Field = Field::new(4, 0, DEPCMD);
pub const DEPCMD_CMDIOC: Field = Field::new(1, 8, DEPCMD);
pub const DEPCMD_CMDACT: Field = Field::new(1, 10, DEPCMD);
pub const DEPCMD_HIPRI_FORCERM: Field = Field::new(1, 11, DEPCMD);
pub const DEPCMD_CMDSTATUS: Field = Field::new(4, 12, DEPCMD);
/// Transfer resource index returned by START_XFER, also the target of END_XFER/UPDATE_XFER
pub const DEPCMD_XFER_RSC_IDX: Field = Field::new(7, 16, DEPCMD);
/// Stream id or isochronous frame number for START_XFER
pub const DEPCMD_PARAM: Field = Field::new(16, 16, DEPCMD);

/* DEPCMD command types */
pub const DEPCMD_SET_EP_CONFIG: u32 = 0x1;
pub const DEPCMD_SET_EP_XFER_RES_CONFIG: u32 = 0x2;
pub const DEPCMD_GET_EP_STATE: u32 = 0x3;
pub const DEPCMD_SET_STALL: u32 = 0x4;
pub const DEPCMD_CLEAR_STALL: u32 = 0x5;
pub const DEPCMD_START_XFER: u32 = 0x6;
pub const DEPCMD_UPDATE_XFER: u32 = 0x7;
pub const DEPCMD_END_XFER: u32 = 0x8;
pub const DEPCMD_START_NEW_CONFIG: u32 = 0x9;

/* DGCMD command types */
pub const DGCMD_SEL_FIFO_FLUSH: u32 = 0x9;
pub const DGCMD_ALL_FIFO_FLUSH: u32 = 0xA;
pub const DGCMD_SET_EP_NRDY: u32 = 0xC;
/// Direction bit of the DGCMDPAR argument to SEL_FIFO_FLUSH
pub const DGCMDPAR_FIFO_TX: u32 = 1 << 5;

/* SET_EP_CONFIG parameter 0 */
pub const EPCFG0: Register = Register::new(0, 0xFFFF_FFFF);
pub const EPCFG0_EPTYPE: Field = Field::new(2, 1, EPCFG0);
pub const EPCFG0_MPS: Field = Field::new(11, 3, EPCFG0);
pub const EPCFG0_FIFO_NUM: Field = Field::new(5, 17, EPCFG0);
pub const EPCFG0_BRST: Field = Field::new(4, 22, EPCFG0);
pub const EPCFG0_ACTION: Field = Field::new(2, 30, EPCFG0);

/* SET_EP_CONFIG parameter 1 */
pub const EPCFG1: Register = Register::new(0, 0xFFFF_FFFF);
pub const EPCFG1_INTR_NUM: Field = Field::new(5, 0, EPCFG1);
pub const EPCFG1_XFER_CMPLT_EN: Field = Field::new(1, 8, EPCFG1);
pub const EPCFG1_XFER_IN_PRGRS_EN: Field = Field::new(1, 9, EPCFG1);
pub const EPCFG1_XFER_NRDY_EN: Field = Field::new(1, 10, EPCFG1);
pub const EPCFG1_STRM_EVT_EN: Field = Field::new(1, 13, EPCFG1);
pub const EPCFG1_INTERVAL: Field = Field::new(8, 16, EPCFG1);
pub const EPCFG1_STRM_CAP: Field = Field::new(1, 24, EPCFG1);
pub const EPCFG1_EP_DIR: Field = Field::new(1, 25, EPCFG1);
pub const EPCFG1_EP_NUM: Field = Field::new(4, 26, EPCFG1);

/// Bits of DEVTEN enabled at init: every device event except SOF.
pub const DEVTEN_DEFAULT: u32 = DEVTEN_DISCONNEVTEN.bits()
    | DEVTEN_USBRSTEVTEN.bits()
    | DEVTEN_CONNECTDONEEVTEN.bits()
    | DEVTEN_ULSTCNGEN.bits()
    | DEVTEN_WKUPEVTEN.bits()
    | DEVTEN_HIBERNATIONREQEVTEN.bits()
    | DEVTEN_U3L2L1SUSPEN.bits()
    | DEVTEN_ERRTICERREVTEN.bits()
    | DEVTEN_CMDCMPLTEN.bits()
    | DEVTEN_EVNTOVERFLOWEN.bits()
    | DEVTEN_VNDRDEVTSTRCVEDEN.bits();
