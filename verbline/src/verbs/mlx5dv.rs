//! Declarations for the parts of `libmlx5`'s direct-verbs interface used by
//! striding receive queues. Layouts follow `<infiniband/mlx5dv.h>`.

#![allow(non_camel_case_types)]

use std::os::raw::c_int;

use rdma_sys::{ibv_context, ibv_device, ibv_wq, ibv_wq_init_attr};

pub(crate) const MLX5DV_CONTEXT_MASK_STRIDING_RQ: u64 = 1 << 2;
pub(crate) const MLX5DV_WQ_INIT_ATTR_MASK_STRIDING_RQ: u64 = 1 << 0;

/// Byte-count word of a completion on a striding queue.
pub(crate) const MPRQ_LEN_MASK: u32 = 0x0000_ffff;
pub(crate) const MPRQ_STRIDE_NUM_MASK: u32 = 0x3fff_0000;
pub(crate) const MPRQ_STRIDE_NUM_SHIFT: u32 = 16;
pub(crate) const MPRQ_FILLER_MASK: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct mlx5dv_cqe_comp_caps {
    pub max_num: u32,
    pub supported_format: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct mlx5dv_sw_parsing_caps {
    pub sw_parsing_offloads: u32,
    pub supported_qpts: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct mlx5dv_striding_rq_caps {
    pub min_single_stride_log_num_of_bytes: u32,
    pub max_single_stride_log_num_of_bytes: u32,
    pub min_single_wqe_log_num_of_strides: u32,
    pub max_single_wqe_log_num_of_strides: u32,
    pub supported_qpts: u32,
}

/// Leading fields of `struct mlx5dv_context`. The library only writes the
/// fields selected by `comp_mask`; the tail absorbs newer additions.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct mlx5dv_context {
    pub version: u8,
    pub flags: u64,
    pub comp_mask: u64,
    pub cqe_comp_caps: mlx5dv_cqe_comp_caps,
    pub sw_parsing_caps: mlx5dv_sw_parsing_caps,
    pub striding_rq_caps: mlx5dv_striding_rq_caps,
    pub tunnel_offloads_caps: u32,
    _reserved: [u64; 32],
}

impl mlx5dv_context {
    pub(crate) fn with_mask(comp_mask: u64) -> Self {
        mlx5dv_context {
            version: 0,
            flags: 0,
            comp_mask,
            cqe_comp_caps: Default::default(),
            sw_parsing_caps: Default::default(),
            striding_rq_caps: Default::default(),
            tunnel_offloads_caps: 0,
            _reserved: [0; 32],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct mlx5dv_striding_rq_init_attr {
    pub single_stride_log_num_of_bytes: u32,
    pub single_wqe_log_num_of_strides: u32,
    pub two_byte_shift_en: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct mlx5dv_wq_init_attr {
    pub comp_mask: u64,
    pub striding_rq_attrs: mlx5dv_striding_rq_init_attr,
}

#[link(name = "mlx5")]
unsafe extern "C" {
    pub(crate) fn mlx5dv_is_supported(device: *mut ibv_device) -> bool;
    pub(crate) fn mlx5dv_query_device(ctx: *mut ibv_context, attrs_out: *mut mlx5dv_context)
    -> c_int;
    pub(crate) fn mlx5dv_create_wq(
        context: *mut ibv_context,
        wq_init_attr: *mut ibv_wq_init_attr,
        mlx5_wq_attr: *mut mlx5dv_wq_init_attr,
    ) -> *mut ibv_wq;
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use super::*;

    #[test]
    fn layouts_match_the_c_headers() {
        assert_eq!(offset_of!(mlx5dv_context, comp_mask), 16);
        assert_eq!(offset_of!(mlx5dv_context, striding_rq_caps), 40);
        assert_eq!(size_of::<mlx5dv_striding_rq_caps>(), 20);
        assert_eq!(offset_of!(mlx5dv_wq_init_attr, striding_rq_attrs), 8);
        assert_eq!(size_of::<mlx5dv_wq_init_attr>(), 24);
    }
}
