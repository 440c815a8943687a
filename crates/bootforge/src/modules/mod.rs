use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::TaskRegistry;
use crate::planner::Plan;

pub mod bootscript;
pub mod build;
pub mod collect;
pub mod configure;
pub mod container;
pub mod core;
pub mod patches;
pub mod source;
pub mod tool;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

/// Which side of the container boundary a plan runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// Stage, build the image, run the container, export artifacts.
    Host,
    /// Fetch, unpack, patch, configure, build, collect (inside the container).
    Driver,
}

impl Pipeline {
    pub fn modules(self) -> Vec<Box<dyn Module>> {
        match self {
            Pipeline::Host => vec![
                Box::new(core::CoreModule),
                Box::new(container::ContainerModule),
            ],
            Pipeline::Driver => vec![
                Box::new(core::CoreModule),
                Box::new(source::SourceModule),
                Box::new(patches::PatchesModule),
                Box::new(configure::ConfigureModule),
                Box::new(build::BuildModule),
                Box::new(tool::ToolModule),
                Box::new(bootscript::BootscriptModule),
                Box::new(collect::CollectModule),
            ],
        }
    }

    pub fn registry(self) -> Result<TaskRegistry> {
        match self {
            Pipeline::Host => crate::executor::host_registry(),
            Pipeline::Driver => crate::executor::driver_registry(),
        }
    }
}

pub fn build_plan(doc: &ConfigDoc, pipeline: Pipeline) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in pipeline.modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    // Surface ordering problems at plan time, not halfway through a build.
    plan.ordered()?;
    Ok(plan)
}
