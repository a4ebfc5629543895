use std::env;
use std::fs;

use tensor_alloc::{
    error::Result,
    memory::{placements_by_tier, ExportFormat, LivenessAnalysis},
    AllocatorConfig, ExecutionSchedule, MemoryPlanner, SectionInfo, TensorDesc, TensorStore, TensorTable, Tier,
};

// Small convolutional network: persistent input, weights and output,
// activations in fast memory and one spilled activation in slow memory
fn create_mock_graph() -> (ExecutionSchedule, TensorTable) {
    let mut store = TensorTable::new();
    let input = store.add(TensorDesc::new("input", 3 * 224 * 224).persistent().prefer(Tier::Slow));
    let conv_w = store.add(TensorDesc::new("conv_weight", 32 * 3 * 3 * 3).with_alignment(128).persistent());
    let fc_w = store.add(TensorDesc::new("fc_weight", 10 * 1024).with_alignment(128).persistent());

    let conv_out = store.add(TensorDesc::new("conv_output", 32 * 1024).with_alignment(128));
    let relu_out = store.add(TensorDesc::new("relu_output", 32 * 1024).with_alignment(128));
    let pool_out = store.add(TensorDesc::new("pool_output", 8 * 1024).with_alignment(128));
    let skip = store.add(TensorDesc::new("skip", 32 * 1024).prefer(Tier::Slow));

    // Two halves of one concatenation buffer
    let left = store.add(TensorDesc::new("concat_left", 4096).in_section(SectionInfo::new(1, 0)));
    let right = store.add(TensorDesc::new("concat_right", 4096).in_section(SectionInfo::new(1, 4096)));
    let output = store.add(TensorDesc::new("output", 10 * 4).persistent().prefer(Tier::Slow));

    let mut schedule = ExecutionSchedule::default();
    schedule.push("conv", vec![input, conv_w], vec![conv_out]);
    schedule.push("relu", vec![conv_out], vec![relu_out, skip]);
    schedule.push("pool", vec![relu_out], vec![pool_out]);
    schedule.push("branch_left", vec![pool_out], vec![left]);
    schedule.push("branch_right", vec![skip], vec![right]);
    schedule.push("fc", vec![left, right, fc_w], vec![output]);
    (schedule, store)
}

fn main() -> Result<()> {
    println!("Tensor Memory Planning Example");
    println!("------------------------------");

    // Optional arguments: configuration JSON, plan output path
    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => AllocatorConfig::from_json_str(&fs::read_to_string(path)?)?,
        None => AllocatorConfig::new().set_fast_tier(0, 256 * 1024),
    };
    println!("Configuration:\n{}", config.to_json_string()?);

    let (schedule, mut store) = create_mock_graph();
    println!("\nCreated mock schedule with {} nodes and {} tensors", schedule.len(), store.len());

    println!("\n1. Tensor Lifetimes");
    println!("-------------------");
    let liveness = LivenessAnalysis::analyze(&schedule, &store, |_| true);
    for tensor in liveness.tensors() {
        println!("  {:<14} {}", store.desc(tensor).name, liveness.lifetime(tensor));
    }
    let peak = liveness.max_capacity();
    println!("Memory pressure per step: {:?}", liveness.memory_pressure());
    println!("Peak: {} bytes at step {}", peak.bytes, peak.step);

    println!("\n2. Planning");
    println!("-----------");
    let plan = MemoryPlanner::new(config).plan(&schedule, &mut store)?;
    if let (Some(workspace), Some(sizing)) = (plan.workspace, plan.workspace_sizing) {
        println!(
            "Workspace {} chosen after {} probes (bounds {} - {})",
            workspace, sizing.probes, sizing.lower_bound, sizing.upper_bound
        );
    }
    for epoch in &plan.epochs {
        println!(
            "  epoch {}: steps {}-{}, {} tensors, {} bytes",
            epoch.index, epoch.first_step, epoch.last_step, epoch.tensors, epoch.bytes
        );
    }
    println!("Persistent fast bytes: {}", plan.fast_persistent_bytes);
    println!("Slow tier high water mark: {}", plan.slow_high_water_mark);
    for &id in &plan.demoted {
        println!("  {} did not fit in fast memory", store.desc(id).name);
    }

    println!("\n3. Placements");
    println!("-------------");
    for (tier, tensors) in placements_by_tier(&plan) {
        println!("{} memory:", tier);
        for (id, offset) in tensors {
            println!("  {:<14} 0x{:x}", store.desc(id).name, offset);
        }
    }

    if let Some(path) = args.get(2) {
        plan.write_to(path, ExportFormat::Json)?;
        println!("\nPlan written to {}", path);
    }
    Ok(())
}
