//! Fragment descriptor: partitioning input fragments into per-device
//! kernels
//!
//! For each outer-table fragment: evaluate skip conditions (sargable quals
//! against fragment min/max), ask the policy for a device, and enforce the
//! running per-device byte budget. UNION ALL builds kernels per input
//! table; multifrag mode batches a device's fragments into one kernel with
//! the inner tables broadcast.

use crate::buffer::MemoryInfo;
use crate::codegen::DeviceKind;
use crate::error::{Error, Result};
use crate::ir::{BinOp, Expr, LiteralValue};
use crate::plan::ExecutionUnit;
use crate::storage::{ColumnStats, Fragment, TableData};
use crate::SystemConfig;
use tracing::debug;

/// Device placement policy. The default round-robins GPU fragments across
/// devices and keeps everything on CPU when no GPU is present.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionPolicy {
    /// Prefer GPU placement when a device exists
    pub prefer_gpu: bool,
    /// Available GPU devices
    pub gpu_device_count: usize,
}

impl ExecutionPolicy {
    /// CPU-only policy.
    #[must_use]
    pub const fn cpu_only() -> Self {
        Self {
            prefer_gpu: false,
            gpu_device_count: 0,
        }
    }

    /// GPU-preferred policy over `devices` GPUs.
    #[must_use]
    pub const fn gpu(devices: usize) -> Self {
        Self {
            prefer_gpu: devices > 0,
            gpu_device_count: devices,
        }
    }

    fn assign(&self, ordinal: usize) -> (DeviceKind, usize) {
        if self.prefer_gpu && self.gpu_device_count > 0 {
            (DeviceKind::Gpu, ordinal % self.gpu_device_count)
        } else {
            (DeviceKind::Cpu, 0)
        }
    }
}

/// One fragment assigned to a kernel: (input position, fragment position).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    /// Index into the unit's input list (the kernel's driving table)
    pub input_idx: usize,
    /// Fragment position within that table
    pub fragment_idx: usize,
    /// Fragment row count
    pub row_count: usize,
}

/// One kernel's work assignment.
#[derive(Debug, Clone)]
pub struct KernelDescriptor {
    /// Placement
    pub device: DeviceKind,
    /// Device ordinal for GPU kernels
    pub device_id: usize,
    /// Driving fragments, scan order
    pub fragments: Vec<FragmentRef>,
}

/// The per-query fragment partition.
#[derive(Debug)]
pub struct QueryFragmentDescriptor {
    /// Kernels to launch
    pub kernels: Vec<KernelDescriptor>,
    /// Fragments skipped by metadata
    pub skipped_fragments: usize,
}

impl QueryFragmentDescriptor {
    /// Partition the unit's driving fragments into kernels.
    ///
    /// # Errors
    /// [`Error::QueryMustRunOnCpu`] when a GPU device's input-byte budget
    /// (`gpu_input_mem_limit_percent` × device memory) would be exceeded.
    pub fn build(
        unit: &ExecutionUnit,
        tables: &[&TableData],
        policy: ExecutionPolicy,
        gpu_mem: Option<MemoryInfo>,
        config: &SystemConfig,
    ) -> Result<Self> {
        // UNION ALL: every input drives kernels; otherwise input 0 drives
        // and the rest broadcast as join inners
        let driving_inputs: Vec<usize> = if unit.union_all {
            (0..tables.len()).collect()
        } else {
            vec![0]
        };

        let mut skipped = 0usize;
        let mut assignments: Vec<(DeviceKind, usize, FragmentRef)> = Vec::new();
        let mut ordinal = 0usize;

        for &input_idx in &driving_inputs {
            let table = tables
                .get(input_idx)
                .ok_or_else(|| Error::InvalidInput(format!("missing input {input_idx}")))?;
            for (fragment_idx, frag) in table.fragments.iter().enumerate() {
                if fragment_skippable(&unit.simple_quals, frag, input_idx) {
                    skipped += 1;
                    continue;
                }
                let (device, device_id) = policy.assign(ordinal);
                ordinal += 1;
                assignments.push((
                    device,
                    device_id,
                    FragmentRef {
                        input_idx,
                        fragment_idx,
                        row_count: frag.row_count,
                    },
                ));
            }
        }
        debug!(kernels = assignments.len(), skipped, "partitioned fragments");

        // running per-device byte budget
        if let Some(mem) = gpu_mem {
            #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let budget = (mem.total_bytes as f64 * config.gpu_input_mem_limit_percent) as usize;
            let mut per_device: Vec<usize> = vec![0; policy.gpu_device_count.max(1)];
            for (device, device_id, frag) in &assignments {
                if *device != DeviceKind::Gpu {
                    continue;
                }
                let table = tables[frag.input_idx];
                let bytes_per_row: usize = table
                    .schema
                    .iter()
                    .map(|t| t.ty.byte_width().unwrap_or(8))
                    .sum();
                per_device[*device_id] += frag.row_count * bytes_per_row;
                if per_device[*device_id] > budget {
                    return Err(Error::QueryMustRunOnCpu(format!(
                        "device {device_id} input bytes {} exceed budget {budget}",
                        per_device[*device_id]
                    )));
                }
            }
        }

        // group into kernels: multifrag batches one kernel per device,
        // otherwise one kernel per fragment
        let kernels = if config.allow_multifrag {
            let mut by_device: Vec<((DeviceKind, usize), Vec<FragmentRef>)> = Vec::new();
            for (device, device_id, frag) in assignments {
                match by_device
                    .iter_mut()
                    .find(|((d, id), _)| *d == device && *id == device_id)
                {
                    Some((_, frags)) => frags.push(frag),
                    None => by_device.push(((device, device_id), vec![frag])),
                }
            }
            by_device
                .into_iter()
                .map(|((device, device_id), fragments)| KernelDescriptor {
                    device,
                    device_id,
                    fragments,
                })
                .collect()
        } else {
            assignments
                .into_iter()
                .map(|(device, device_id, frag)| KernelDescriptor {
                    device,
                    device_id,
                    fragments: vec![frag],
                })
                .collect()
        };

        Ok(Self {
            kernels,
            skipped_fragments: skipped,
        })
    }
}

/// Whether fragment metadata proves a sargable qual can never hold.
fn fragment_skippable(simple_quals: &[Expr], frag: &Fragment, input_idx: usize) -> bool {
    simple_quals
        .iter()
        .any(|q| qual_excludes_fragment(q, frag, input_idx))
}

fn qual_excludes_fragment(qual: &Expr, frag: &Fragment, input_idx: usize) -> bool {
    let Some((column, op, value)) = sargable_shape(qual, input_idx) else {
        return false;
    };
    let Some(Some(stats)) = frag.stats.get(column) else {
        return false;
    };
    range_disjoint(op, value, stats)
}

/// `col <op> int-literal` over the driving input.
fn sargable_shape(qual: &Expr, input_idx: usize) -> Option<(usize, BinOp, i64)> {
    let Expr::Binary { op, lhs, rhs } = qual else {
        return None;
    };
    let Expr::ColumnRef {
        input_idx: qi,
        column_idx,
        ..
    } = lhs.as_ref()
    else {
        return None;
    };
    if *qi != input_idx {
        return None;
    }
    let Expr::Literal {
        value: LiteralValue::Int(v),
        ..
    } = rhs.as_ref()
    else {
        return None;
    };
    op.is_comparison().then_some((*column_idx, *op, *v))
}

fn range_disjoint(op: BinOp, value: i64, stats: &ColumnStats) -> bool {
    match op {
        BinOp::Eq => value < stats.min || value > stats.max,
        BinOp::Lt => stats.min >= value,
        BinOp::Le => stats.min > value,
        BinOp::Gt => stats.max <= value,
        BinOp::Ge => stats.max < value,
        _ => false,
    }
}
