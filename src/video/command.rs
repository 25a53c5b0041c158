//! Command recording.
//!
//! A [`CommandList`] is recorded on one thread and handed to
//! `Device::submit`. Barriers are explicit: the device validates that every
//! read-after-write and write-after-write between commands is separated by a
//! barrier covering the producing and consuming stage/access.

use crate::accel::AccelerationStructureBuild;

use super::types::{
    Access, AccelerationStructureHandle, BufferHandle, BufferRange, PipelineHandle, PipelineStage,
};

/// Memory dependency on one buffer range.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferBarrier {
    pub range: BufferRange,
    pub src_access: Access,
    pub dst_access: Access,
}

/// Execution + memory dependency between commands.
#[derive(Debug, Clone, PartialEq)]
pub struct Barrier {
    pub src_stage: PipelineStage,
    pub dst_stage: PipelineStage,
    /// Global memory dependency applying to every resource.
    pub memory: Option<(Access, Access)>,
    pub buffers: Vec<BufferBarrier>,
}

impl Barrier {
    pub fn new(src_stage: PipelineStage, dst_stage: PipelineStage) -> Self {
        Self { src_stage, dst_stage, memory: None, buffers: Vec::new() }
    }

    /// Global memory barrier.
    pub fn memory(
        src_stage: PipelineStage,
        src_access: Access,
        dst_stage: PipelineStage,
        dst_access: Access,
    ) -> Self {
        Self { src_stage, dst_stage, memory: Some((src_access, dst_access)), buffers: Vec::new() }
    }

    pub fn buffer(mut self, range: BufferRange, src_access: Access, dst_access: Access) -> Self {
        self.buffers.push(BufferBarrier { range, src_access, dst_access });
        self
    }
}

/// Recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindComputePipeline(PipelineHandle),
    BindBuffer { binding: u32, range: BufferRange },
    BindAccelerationStructure { binding: u32, structure: AccelerationStructureHandle },
    PushConstants(Vec<u8>),
    Dispatch([u32; 3]),
    PipelineBarrier(Barrier),
    FillBuffer { range: BufferRange, value: u32 },
    CopyBuffer { src: BufferRange, dst: BufferHandle, dst_offset: u64 },
    BuildAccelerationStructures(Vec<AccelerationStructureBuild>),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BindComputePipeline(_) => "bind_compute_pipeline",
            Self::BindBuffer { .. } => "bind_buffer",
            Self::BindAccelerationStructure { .. } => "bind_acceleration_structure",
            Self::PushConstants(_) => "push_constants",
            Self::Dispatch(_) => "dispatch",
            Self::PipelineBarrier(_) => "pipeline_barrier",
            Self::FillBuffer { .. } => "fill_buffer",
            Self::CopyBuffer { .. } => "copy_buffer",
            Self::BuildAccelerationStructures(_) => "build_acceleration_structures",
        }
    }
}

/// Ordered list of commands for one submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    label: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), commands: Vec::new() }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn bind_compute_pipeline(&mut self, pipeline: PipelineHandle) -> &mut Self {
        self.push(Command::BindComputePipeline(pipeline))
    }

    pub fn bind_buffer(&mut self, binding: u32, range: BufferRange) -> &mut Self {
        self.push(Command::BindBuffer { binding, range })
    }

    pub fn bind_acceleration_structure(
        &mut self,
        binding: u32,
        structure: AccelerationStructureHandle,
    ) -> &mut Self {
        self.push(Command::BindAccelerationStructure { binding, structure })
    }

    pub fn push_constants<T: bytemuck::Pod>(&mut self, value: &T) -> &mut Self {
        self.push(Command::PushConstants(bytemuck::bytes_of(value).to_vec()))
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) -> &mut Self {
        self.push(Command::Dispatch(groups))
    }

    pub fn pipeline_barrier(&mut self, barrier: Barrier) -> &mut Self {
        self.push(Command::PipelineBarrier(barrier))
    }

    pub fn fill_buffer(&mut self, range: BufferRange, value: u32) -> &mut Self {
        self.push(Command::FillBuffer { range, value })
    }

    pub fn copy_buffer(&mut self, src: BufferRange, dst: BufferHandle, dst_offset: u64) -> &mut Self {
        self.push(Command::CopyBuffer { src, dst, dst_offset })
    }

    pub fn build_acceleration_structures(&mut self, builds: Vec<AccelerationStructureBuild>) -> &mut Self {
        self.push(Command::BuildAccelerationStructures(builds))
    }
}
