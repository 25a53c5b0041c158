//! Submission-time hazard validation.
//!
//! Every write recorded in a command list stays *pending* until a barrier
//! whose source scope covers it makes it visible to a destination scope.
//! A later read or write of an overlapping range must be covered by one of
//! those visibility grants, otherwise the list is rejected with
//! [`Error::MissingBarrier`].

use std::collections::HashMap;

use crate::accel::{AccelerationStructureBuild, GeometryData};
use crate::util::{Error, Result};

use super::command::{Barrier, Command, CommandList};
use super::shader::BindingKind;
use super::types::{
    Access, AccelerationStructureHandle, BufferHandle, BufferRange, PipelineHandle, PipelineStage,
};

/// Device-side lookups the validator needs.
pub trait UseResolver {
    /// Binding layout of a pipeline.
    fn binding_kind(&self, pipeline: PipelineHandle, binding: u32) -> Result<Option<BindingKind>>;
    /// Backing range of a structure.
    fn structure_range(&self, structure: AccelerationStructureHandle) -> Result<BufferRange>;
    /// Structures a top-level build reads through its instance references.
    fn build_dependencies(&self, build: &AccelerationStructureBuild) -> Result<Vec<AccelerationStructureHandle>>;
}

#[derive(Debug, Clone, Copy)]
struct Use {
    range: BufferRange,
    stage: PipelineStage,
    access: Access,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    offset: u64,
    end: u64,
    stage: PipelineStage,
    access: Access,
    command: usize,
    visible: Vec<(PipelineStage, Access)>,
}

impl PendingWrite {
    fn overlaps(&self, range: &BufferRange) -> bool {
        self.offset < range.end() && range.offset < self.end
    }

    fn covered_by(&self, stage: PipelineStage, access: Access) -> bool {
        self.visible.iter().any(|(s, a)| s.covers(stage) && a.covers(access))
    }
}

/// Tracks pending writes across the commands of one list.
#[derive(Debug, Default)]
pub struct HazardTracker {
    pending: HashMap<BufferHandle, Vec<PendingWrite>>,
}

impl HazardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn barrier(&mut self, barrier: &Barrier) {
        for writes in self.pending.values_mut() {
            for w in writes.iter_mut() {
                if !barrier.src_stage.covers(w.stage) {
                    continue;
                }
                if let Some((src, dst)) = barrier.memory {
                    if src.covers(w.access) {
                        w.visible.push((barrier.dst_stage, dst));
                    }
                }
            }
        }
        for b in &barrier.buffers {
            let Some(writes) = self.pending.get_mut(&b.range.buffer) else { continue };
            for w in writes.iter_mut() {
                if w.overlaps(&b.range) && barrier.src_stage.covers(w.stage) && b.src_access.covers(w.access) {
                    w.visible.push((barrier.dst_stage, b.dst_access));
                }
            }
        }
    }

    fn check(&self, u: &Use, command: usize, name: &str, label: &str) -> Result<()> {
        let Some(writes) = self.pending.get(&u.range.buffer) else { return Ok(()) };
        for w in writes.iter().filter(|w| w.overlaps(&u.range)) {
            if !w.covered_by(u.stage, u.access) {
                return Err(Error::MissingBarrier {
                    command,
                    label: label.to_string(),
                    detail: format!(
                        "{name} uses {:?} [{}..{}) as {:?}/{:?} after unsynchronized {:?}/{:?} write by command {}",
                        u.range.buffer,
                        u.range.offset,
                        u.range.end(),
                        u.stage,
                        u.access,
                        w.stage,
                        w.access,
                        w.command
                    ),
                });
            }
        }
        Ok(())
    }

    fn record_write(&mut self, u: &Use, command: usize) {
        let writes = self.pending.entry(u.range.buffer).or_default();
        writes.retain(|w| !(w.offset >= u.range.offset && w.end <= u.range.end()));
        writes.push(PendingWrite {
            offset: u.range.offset,
            end: u.range.end(),
            stage: u.stage,
            access: u.access.writes(),
            command,
            visible: Vec::new(),
        });
    }

    /// Validate one command's uses, then record its writes.
    fn apply(&mut self, uses: &[Use], command: usize, name: &str, label: &str) -> Result<()> {
        for u in uses {
            self.check(u, command, name, label)?;
        }
        for u in uses.iter().filter(|u| u.access.is_write()) {
            self.record_write(u, command);
        }
        Ok(())
    }
}

#[derive(Default)]
struct BindState {
    pipeline: Option<PipelineHandle>,
    buffers: HashMap<u32, BufferRange>,
    structures: HashMap<u32, AccelerationStructureHandle>,
}

fn dispatch_uses(state: &BindState, resolver: &dyn UseResolver) -> Result<Vec<Use>> {
    let pipeline = state
        .pipeline
        .ok_or_else(|| Error::other("dispatch without a bound compute pipeline"))?;
    let stage = PipelineStage::COMPUTE_SHADER;
    let mut uses = Vec::new();
    for (&binding, range) in &state.buffers {
        let access = match resolver.binding_kind(pipeline, binding)? {
            Some(BindingKind::StorageRead) => Access::SHADER_READ,
            Some(BindingKind::StorageReadWrite) => Access::SHADER_READ | Access::SHADER_WRITE,
            Some(BindingKind::Uniform) => Access::UNIFORM_READ,
            Some(BindingKind::AccelerationStructure) | None => continue,
        };
        uses.push(Use { range: *range, stage, access });
    }
    for structure in state.structures.values() {
        let range = resolver.structure_range(*structure)?;
        uses.push(Use { range, stage, access: Access::ACCELERATION_STRUCTURE_READ });
    }
    Ok(uses)
}

fn build_uses(builds: &[AccelerationStructureBuild], resolver: &dyn UseResolver) -> Result<Vec<Use>> {
    let stage = PipelineStage::ACCELERATION_STRUCTURE_BUILD;
    let mut uses = Vec::new();
    for build in builds {
        for geometry in &build.info.geometries {
            for range in geometry.data.input_ranges() {
                uses.push(Use { range, stage, access: Access::SHADER_READ });
            }
            if let GeometryData::Instances { .. } = geometry.data {
                for dep in resolver.build_dependencies(build)? {
                    let range = resolver.structure_range(dep)?;
                    uses.push(Use { range, stage, access: Access::ACCELERATION_STRUCTURE_READ });
                }
            }
        }
        if let Some(scratch) = build.info.scratch {
            uses.push(Use {
                range: scratch,
                stage,
                access: Access::ACCELERATION_STRUCTURE_READ | Access::ACCELERATION_STRUCTURE_WRITE,
            });
        }
        if let Some(dst) = build.info.dst {
            let range = resolver.structure_range(dst)?;
            uses.push(Use { range, stage, access: Access::ACCELERATION_STRUCTURE_WRITE });
        }
    }
    Ok(uses)
}

/// Validate a whole list. Builds in one command are checked one after
/// another, so a TLAS recorded next to the BLAS it references is rejected.
pub fn validate(list: &CommandList, resolver: &dyn UseResolver) -> Result<()> {
    let mut tracker = HazardTracker::new();
    let mut state = BindState::default();
    let label = list.label();
    for (index, command) in list.commands().iter().enumerate() {
        let name = command.name();
        match command {
            Command::BindComputePipeline(p) => {
                state.pipeline = Some(*p);
            }
            Command::BindBuffer { binding, range } => {
                state.buffers.insert(*binding, *range);
            }
            Command::BindAccelerationStructure { binding, structure } => {
                state.structures.insert(*binding, *structure);
            }
            Command::PushConstants(_) => {}
            Command::Dispatch(_) => {
                let uses = dispatch_uses(&state, resolver)?;
                tracker.apply(&uses, index, name, label)?;
            }
            Command::PipelineBarrier(barrier) => tracker.barrier(barrier),
            Command::FillBuffer { range, .. } => {
                let u = Use { range: *range, stage: PipelineStage::TRANSFER, access: Access::TRANSFER_WRITE };
                tracker.apply(&[u], index, name, label)?;
            }
            Command::CopyBuffer { src, dst, dst_offset } => {
                let uses = [
                    Use { range: *src, stage: PipelineStage::TRANSFER, access: Access::TRANSFER_READ },
                    Use {
                        range: BufferRange::new(*dst, *dst_offset, src.size),
                        stage: PipelineStage::TRANSFER,
                        access: Access::TRANSFER_WRITE,
                    },
                ];
                tracker.apply(&uses, index, name, label)?;
            }
            Command::BuildAccelerationStructures(builds) => {
                for build in builds {
                    let uses = build_uses(std::slice::from_ref(build), resolver)?;
                    tracker.apply(&uses, index, name, label)?;
                }
            }
        }
    }
    Ok(())
}
