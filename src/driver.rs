//! The demonstration run: one lazily linked call, invoked twice.

use chrono::{DateTime, Local};
use log::info;

use crate::emit::{CallerShape, ConstantTarget, TargetEmitter};
use crate::error::Result;
use crate::linker::{LazyCall, LazyLinker, LinkerConfig};
use crate::models::SiteReport;
use crate::utils::{format_buffer, format_unplaced, log_memory_content};

/// Value the demonstration target returns.
pub const DEMO_RESULT: i32 = 4;

#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: i32,
    pub report: SiteReport,
}

#[derive(Debug, Clone)]
pub struct DemoReport {
    pub call: LazyCall,
    /// Buffer dumps taken before the first call.
    pub before: Vec<String>,
    pub first: Invocation,
    pub second: Invocation,
}

impl DemoReport {
    /// Human-readable log of both invocations. The setup dumps in
    /// [`DemoReport::before`] are printed separately, ahead of the first call.
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();

        lines.push("invoke caller:".to_string());
        lines.extend(render_patch(&self.first.report));
        lines.push(format!("res = {}", self.first.result));
        lines.push(format_buffer("caller patched", self.call.caller()));

        lines.push(String::new());
        lines.push("invoke caller again:".to_string());
        lines.push(format!(
            "res = {} (faults at this call site: {})",
            self.second.result, self.second.report.fault_count
        ));
        lines
    }
}

fn render_patch(report: &SiteReport) -> Vec<String> {
    let Some(patch) = report.patch else {
        return vec!["\tno fault recorded".to_string()];
    };

    let at: DateTime<Local> = patch.patched_at.into();
    vec![
        format!("\tfault resolved at {}", at.format("%H:%M:%S%.6f")),
        format!("\trbp = 0x{:x}", patch.frame_pointer),
        format!("\trsp = 0x{:x}", patch.stack_pointer),
        format!("\treturn address = 0x{:x}", patch.return_address),
        format!("\tcall site = 0x{:x}", patch.call_site),
        format!(
            "\toperand @ 0x{:x}: 0x{:x} -> 0x{:x}",
            patch.operand_address,
            patch.previous_operand,
            patch.target.base()
        ),
        format!("\t{}", format_buffer("target", &patch.target)),
    ]
}

/// A linked call that has not been invoked yet.
#[derive(Debug, Clone)]
pub struct PreparedDemo {
    linker: LazyLinker,
    call: LazyCall,
    /// Stub, caller and target dumps, taken while the stub is still armed.
    pub dumps: Vec<String>,
}

impl PreparedDemo {
    pub fn call(&self) -> &LazyCall {
        &self.call
    }

    /// Invokes the call twice and collects the site report after each call.
    ///
    /// With diagnostics enabled the first call stops at the trap marker, so
    /// anything that should be seen must be printed before this runs.
    pub fn run(self) -> Result<DemoReport> {
        let result = self.call.invoke();
        let first = Invocation {
            result,
            report: self.linker.report(&self.call)?,
        };
        info!("First invocation returned {}", result);

        let result = self.call.invoke();
        let second = Invocation {
            result,
            report: self.linker.report(&self.call)?,
        };
        info!("Second invocation returned {}", result);

        Ok(DemoReport {
            call: self.call,
            before: self.dumps,
            first,
            second,
        })
    }
}

/// Installs the linker and links a caller against a target returning
/// [`DEMO_RESULT`], without calling it.
pub fn prepare_demo(config: LinkerConfig) -> Result<PreparedDemo> {
    let linker = LazyLinker::install(config)?;
    let target = ConstantTarget(DEMO_RESULT);
    let call = linker.link(&target, CallerShape::Plain)?;

    let dumps = vec![
        format_buffer("stub", call.stub()),
        format_buffer("caller", call.caller()),
        format_unplaced("target code", &target.emit()),
    ];
    log_memory_content(call.caller().bytes(), call.caller().base());

    Ok(PreparedDemo {
        linker,
        call,
        dumps,
    })
}

/// Prepares the demonstration and calls it twice. All output is collected
/// here, after the handler has returned.
pub fn run_demo(config: LinkerConfig) -> Result<DemoReport> {
    prepare_demo(config)?.run()
}
