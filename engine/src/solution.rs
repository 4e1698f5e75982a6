//! Solution specifications and the factory
//!
//! A [`SolutionSpec`] is what the (out-of-scope) stencil compiler emits:
//! the dimension set, the vars with their halos, the bundles with their
//! predicates and kernel tables, and the packs. [`new_solution`] assembles
//! a runnable [`StencilContext`] from it; [`new_solution_from`] copies the
//! settings of an existing solution into the new one.

use crate::bundle::Bundle;
use crate::context::StencilContext;
use crate::env::KernelEnv;
use crate::expr::PredExpr;
use crate::kernels::{KernelTable, VarRef};
use crate::pack::Pack;
use crate::settings::KernelSettings;
use data::bounds::BoundingBox;
use data::dims::DimSet;
use data::error::{Error, Result};
use data::var::Var;
use std::collections::HashMap;
use std::sync::Arc;

/// Description of one var
#[derive(Clone, Debug)]
pub struct VarSpec {
    pub name: String,
    pub dim_names: Vec<String>,

    /// Per-dim (name, left, right) halos
    pub halos: Vec<(String, i64, i64)>,

    /// Step-dim allocation (rotation capacity); ignored without a step dim
    pub step_alloc: i64,

    /// Max Manhattan distance this var exchanges over; defaults to the
    /// number of domain dims with a halo
    pub l1_norm: Option<i64>,
}
//
impl VarSpec {
    /// A var over the named dims, with no halos yet
    pub fn new(name: impl Into<String>, dim_names: &[&str]) -> Self {
        Self {
            name: name.into(),
            dim_names: dim_names.iter().map(|s| s.to_string()).collect(),
            halos: Vec::new(),
            step_alloc: 0,
            l1_norm: None,
        }
    }

    /// Add a symmetric halo in one dim
    pub fn with_halo(mut self, dim: &str, left: i64, right: i64) -> Self {
        self.halos.push((dim.to_string(), left, right));
        self
    }

    /// Set the step-dim rotation capacity
    pub fn with_step_alloc(mut self, alloc: i64) -> Self {
        self.step_alloc = alloc;
        self
    }

    /// Override the halo-exchange distance
    pub fn with_l1_norm(mut self, norm: i64) -> Self {
        self.l1_norm = Some(norm);
        self
    }

    /// Materialize the var (metadata only)
    pub(crate) fn build(&self, dims: &DimSet) -> Result<Var> {
        let dim_refs: Vec<&str> = self.dim_names.iter().map(|s| s.as_str()).collect();
        let mut v = Var::new(&self.name, dims, &dim_refs)?;
        for (dname, l, r) in &self.halos {
            v.set_left_halo_size(dname, *l)?;
            v.set_right_halo_size(dname, *r)?;
        }
        if self.step_alloc > 0 && v.step_posn().is_some() {
            v.set_alloc_size(dims.step_dim(), self.step_alloc)?;
        }
        let norm = self.l1_norm.unwrap_or_else(|| {
            self.halos
                .iter()
                .filter(|(d, l, r)| dims.domain_posn(d).is_some() && (*l > 0 || *r > 0))
                .count() as i64
        });
        v.set_halo_exchange_l1_norm(norm);
        Ok(v)
    }
}

/// Description of one bundle
#[derive(Clone)]
pub struct BundleSpec {
    pub name: String,

    /// Names of vars (solution or scratch) the kernels read
    pub inputs: Vec<String>,

    /// Names of vars (solution or scratch) the kernels write
    pub outputs: Vec<String>,

    /// Where in the domain the bundle applies
    pub sub_domain: PredExpr,

    /// Which steps the bundle applies at
    pub step_cond: Option<PredExpr>,

    /// Output step = input step + this shift
    pub output_step_shift: i64,

    /// The inner kernels; required
    pub kernels: Option<KernelTable>,

    /// Per-point work estimates
    pub scalar_fp_ops: i64,
    pub points_read: i64,
    pub points_written: i64,

    /// Whether this bundle writes scratch vars
    pub is_scratch: bool,

    /// Names of scratch bundles evaluated before this one, in order
    pub scratch_children: Vec<String>,
}
//
impl BundleSpec {
    /// A solid, unconditional bundle
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            sub_domain: PredExpr::All,
            step_cond: None,
            output_step_shift: 1,
            kernels: None,
            scalar_fp_ops: 0,
            points_read: 0,
            points_written: 0,
            is_scratch: false,
            scratch_children: Vec::new(),
        }
    }

    pub fn reads(mut self, names: &[&str]) -> Self {
        self.inputs = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn writes(mut self, names: &[&str]) -> Self {
        self.outputs = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn over(mut self, sub_domain: PredExpr) -> Self {
        self.sub_domain = sub_domain;
        self
    }

    pub fn when(mut self, step_cond: PredExpr) -> Self {
        self.step_cond = Some(step_cond);
        self
    }

    pub fn with_kernels(mut self, kernels: KernelTable) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn with_work(mut self, fp_ops: i64, reads: i64, writes: i64) -> Self {
        self.scalar_fp_ops = fp_ops;
        self.points_read = reads;
        self.points_written = writes;
        self
    }

    pub fn scratch(mut self) -> Self {
        self.is_scratch = true;
        self
    }

    pub fn needs_scratch(mut self, names: &[&str]) -> Self {
        self.scratch_children = names.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Description of one pack
#[derive(Clone, Debug)]
pub struct PackSpec {
    pub name: String,
    pub bundles: Vec<String>,
}
//
impl PackSpec {
    pub fn new(name: impl Into<String>, bundles: &[&str]) -> Self {
        Self {
            name: name.into(),
            bundles: bundles.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Everything the stencil compiler hands to the runtime
#[derive(Clone)]
pub struct SolutionSpec {
    pub name: String,
    pub target: String,
    pub dims: DimSet,
    pub vars: Vec<VarSpec>,
    pub scratch_vars: Vec<VarSpec>,
    pub bundles: Vec<BundleSpec>,
    pub packs: Vec<PackSpec>,
}

/// Assemble a runnable solution on the given environment
pub fn new_solution(env: &Arc<KernelEnv>, spec: &SolutionSpec) -> Result<StencilContext> {
    let opts = KernelSettings::new(&spec.dims);
    build(env, spec, opts)
}

/// Like [`new_solution`], copying the settings of an existing solution
pub fn new_solution_from(
    env: &Arc<KernelEnv>,
    spec: &SolutionSpec,
    source: &StencilContext,
) -> Result<StencilContext> {
    build(env, spec, source.get_settings().clone())
}

fn build(
    env: &Arc<KernelEnv>,
    spec: &SolutionSpec,
    opts: KernelSettings,
) -> Result<StencilContext> {
    let mut ctx = StencilContext::new(
        spec.name.clone(),
        spec.target.clone(),
        spec.dims.clone(),
        env.clone(),
        opts,
    );

    // Solution vars.
    for vs in &spec.vars {
        let v = vs.build(&spec.dims)?;
        ctx.add_var(v, false)?;
    }

    // Scratch definitions are templates; instances are created per region
    // thread when storage is planned.
    let mut scratch_index: HashMap<String, usize> = HashMap::new();
    for (i, vs) in spec.scratch_vars.iter().enumerate() {
        if scratch_index.insert(vs.name.clone(), i).is_some() {
            return Err(Error::Config(format!(
                "scratch var '{}' is declared twice",
                vs.name
            )));
        }
        // Validate the template eagerly.
        vs.build(&spec.dims)?;
    }
    ctx.scratch_defs = spec.scratch_vars.clone();

    // Bundles, with var names resolved to arena ids or scratch defs.
    let resolve = |ctx: &StencilContext, name: &String| -> Result<VarRef> {
        if let Some(&def) = scratch_index.get(name) {
            return Ok(VarRef::Scratch(def));
        }
        ctx.get_var(name)
            .map(|_| VarRef::Id(*ctx.var_map.get(name).expect("var just found")))
            .ok_or_else(|| Error::Config(format!("bundle references unknown var '{name}'")))
    };
    let mut bundle_index: HashMap<String, usize> = HashMap::new();
    for bs in &spec.bundles {
        let kernels = bs.kernels.clone().ok_or_else(|| {
            Error::Config(format!("bundle '{}' has no kernel table", bs.name))
        })?;
        let inputs = bs
            .inputs
            .iter()
            .map(|n| resolve(&ctx, n))
            .collect::<Result<Vec<_>>>()?;
        let outputs = bs
            .outputs
            .iter()
            .map(|n| resolve(&ctx, n))
            .collect::<Result<Vec<_>>>()?;
        if bs.is_scratch && outputs.iter().any(|o| matches!(o, VarRef::Id(_))) {
            return Err(Error::Config(format!(
                "scratch bundle '{}' writes a non-scratch var",
                bs.name
            )));
        }
        let scratch_children = bs
            .scratch_children
            .iter()
            .map(|n| {
                bundle_index.get(n).copied().ok_or_else(|| {
                    Error::Config(format!(
                        "bundle '{}' needs scratch bundle '{n}', which is not declared \
                         earlier",
                        bs.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let id = ctx.bundles.len();
        bundle_index.insert(bs.name.clone(), id);
        let nddims = spec.dims.num_domain_dims();
        ctx.bundles.push(Bundle {
            name: bs.name.clone(),
            inputs,
            outputs,
            scratch_children,
            depends_on: Vec::new(),
            is_scratch: bs.is_scratch,
            sub_domain: bs.sub_domain.clone(),
            step_cond: bs.step_cond.clone(),
            output_step_shift: bs.output_step_shift,
            kernels,
            scalar_fp_ops: bs.scalar_fp_ops,
            points_read: bs.points_read,
            points_written: bs.points_written,
            bb: BoundingBox::new_empty(nddims),
            bb_list: Vec::new(),
        });
    }

    // Output vars in bundle order drive the allocation priority.
    for b in &ctx.bundles {
        for out in &b.outputs {
            if let VarRef::Id(id) = out {
                if !ctx.output_var_ids.contains(id) {
                    ctx.output_var_ids.push(*id);
                }
            }
        }
    }

    // Packs.
    for ps in &spec.packs {
        let ids = ps
            .bundles
            .iter()
            .map(|n| {
                bundle_index.get(n).copied().ok_or_else(|| {
                    Error::Config(format!(
                        "pack '{}' references unknown bundle '{n}'",
                        ps.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Err(Error::Config(format!("pack '{}' is empty", ps.name)));
        }
        if ids.iter().any(|&bi| ctx.bundles[bi].is_scratch) {
            return Err(Error::Config(format!(
                "pack '{}' contains a scratch bundle; scratch bundles run as \
                 prerequisites only",
                ps.name
            )));
        }
        let opts = ctx.opts.clone();
        ctx.packs.push(Pack::new(&ps.name, ids, &opts));
    }
    if ctx.packs.is_empty() {
        return Err(Error::Config("solution has no packs".to_string()));
    }

    Ok(ctx)
}
