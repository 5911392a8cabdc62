//! Named, batch-dimensioned data buffers
//!
//! This module defines the buffer vocabulary shared by callers, workers and
//! executors. A network exposes named f32 ports with fixed per-item shapes;
//! a `BufferSet` materializes those ports with a leading batch dimension and
//! supports shape-checked per-slot copies between sets of different batch
//! sizes. That one copy operation is how a caller's buffers meet the shared
//! batch buffer, in both directions.

use batchloop_common::error::{BatchLoopError, Result};

/// Per-item shape of a port (batch dimension excluded)
pub type Shape = Vec<usize>;

/// One named input or output port of the executed network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Port name
    pub name: String,

    /// Per-item shape
    pub shape: Shape,
}

impl PortSpec {
    /// Create a new port spec
    pub fn new(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Number of elements in one item of this port
    pub fn item_len(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Input and output ports of the executed network
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    /// Input ports
    pub inputs: Vec<PortSpec>,

    /// Output ports
    pub outputs: Vec<PortSpec>,
}

impl NetworkSpec {
    /// Create a new network spec
    pub fn new(inputs: Vec<PortSpec>, outputs: Vec<PortSpec>) -> Self {
        Self { inputs, outputs }
    }
}

/// One port's storage within a `BufferSet`
#[derive(Debug, Clone)]
pub struct PortBuffer {
    /// Port description
    pub spec: PortSpec,

    /// Flat data, `batch * item_len` elements, row-major with the batch
    /// dimension leading
    pub data: Vec<f32>,
}

impl PortBuffer {
    /// Slice holding one slot's item
    pub fn slot(&self, slot: usize) -> &[f32] {
        let len = self.spec.item_len();
        &self.data[slot * len..(slot + 1) * len]
    }

    /// Mutable slice holding one slot's item
    pub fn slot_mut(&mut self, slot: usize) -> &mut [f32] {
        let len = self.spec.item_len();
        &mut self.data[slot * len..(slot + 1) * len]
    }
}

/// A set of named buffers sharing one batch dimension
#[derive(Debug, Clone)]
pub struct BufferSet {
    batch: usize,
    ports: Vec<PortBuffer>,
}

impl BufferSet {
    /// Allocate zeroed buffers for the given ports and batch size
    pub fn new(specs: &[PortSpec], batch: usize) -> Self {
        let ports = specs
            .iter()
            .map(|spec| PortBuffer {
                spec: spec.clone(),
                data: vec![0.0; batch * spec.item_len()],
            })
            .collect();

        Self { batch, ports }
    }

    /// Batch dimension of this set
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// All ports in declaration order
    pub fn ports(&self) -> &[PortBuffer] {
        &self.ports
    }

    /// All ports, mutable
    pub fn ports_mut(&mut self) -> &mut [PortBuffer] {
        &mut self.ports
    }

    /// Look up a port by name
    pub fn port(&self, name: &str) -> Option<&PortBuffer> {
        self.ports.iter().find(|p| p.spec.name == name)
    }

    /// Look up a port by name, mutable
    pub fn port_mut(&mut self, name: &str) -> Option<&mut PortBuffer> {
        self.ports.iter_mut().find(|p| p.spec.name == name)
    }

    /// Write one item into a port's slot, checking the item length
    pub fn write(&mut self, name: &str, data: &[f32], slot: usize) -> Result<()> {
        if slot >= self.batch {
            return Err(BatchLoopError::shape_mismatch(format!(
                "slot {} out of range for batch {}",
                slot, self.batch
            )));
        }
        let port = self.port_mut(name).ok_or_else(|| {
            BatchLoopError::shape_mismatch(format!("unknown port '{}'", name))
        })?;
        if data.len() != port.spec.item_len() {
            return Err(BatchLoopError::shape_mismatch(format!(
                "port '{}' expects {} elements per item, got {}",
                name,
                port.spec.item_len(),
                data.len()
            )));
        }

        port.slot_mut(slot).copy_from_slice(data);
        Ok(())
    }

    /// Copy every port's item at `src_slot` of `src` into `dst_slot` of
    /// this set. Port names, shapes and slot bounds are checked; sets built
    /// from the same `NetworkSpec` always pass.
    pub fn copy_slot_from(&mut self, src: &BufferSet, dst_slot: usize, src_slot: usize) -> Result<()> {
        if dst_slot >= self.batch || src_slot >= src.batch {
            return Err(BatchLoopError::shape_mismatch(format!(
                "slot {} -> {} out of range for batches {} -> {}",
                src_slot, dst_slot, src.batch, self.batch
            )));
        }

        for dst_port in &mut self.ports {
            let name = dst_port.spec.name.clone();
            let src_port = src.port(&name).ok_or_else(|| {
                BatchLoopError::shape_mismatch(format!("source is missing port '{}'", name))
            })?;
            if src_port.spec.shape != dst_port.spec.shape {
                return Err(BatchLoopError::shape_mismatch(format!(
                    "port '{}' shapes disagree: {:?} vs {:?}",
                    name, src_port.spec.shape, dst_port.spec.shape
                )));
            }

            dst_port
                .slot_mut(dst_slot)
                .copy_from_slice(src_port.slot(src_slot));
        }

        Ok(())
    }
}
