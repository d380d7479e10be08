//! Basic example of a pseudobulk differential state analysis.
//!
//! This example shows how to:
//! 1. Create synthetic single-cell data in three clusters
//! 2. Aggregate cells into pseudobulk samples
//! 3. Test every cluster for stimulation effects
//! 4. Filter and rank the results

use pseudobulk_ds::prelude::*;

const SAMPLES: [(&str, &str); 6] = [
    ("ctrl1", "ctrl"),
    ("ctrl2", "ctrl"),
    ("ctrl3", "ctrl"),
    ("stim1", "stim"),
    ("stim2", "stim"),
    ("stim3", "stim"),
];

fn main() -> Result<()> {
    println!("=== Pseudobulk DS Example ===\n");

    let (cells, metadata) = create_example_data()?;

    println!("Data dimensions:");
    println!("  Cells:    {}", cells.n_cells());
    println!("  Genes:    {}", cells.n_genes());
    println!("  Clusters: {:?}", cells.clusters());
    println!();

    println!("=== Pseudobulk Aggregation ===\n");
    let pseudobulk = aggregate_pseudobulk(&cells, AggregateFn::Sum)?;
    for (cluster, matrix) in pseudobulk.iter() {
        println!(
            "  {:<10} {} samples, cells per sample {:?}",
            cluster,
            matrix.n_samples(),
            matrix.n_cells()
        );
    }
    println!();

    println!("=== Running Analysis ===\n");
    let analysis = Analysis::new()
        .name("stim-vs-ctrl")
        .pairwise("stim", "ctrl")
        .method(TestMethod::QuasiLikelihoodF)
        .min_cells(5);
    let results = analysis.run(&cells, &metadata)?;

    println!("Contrast: {}", results.contrast);
    println!("Clusters tested: {}", results.n_tested());
    for failure in &results.failures {
        println!("  {} failed: {}", failure.cluster_id, failure.reason);
    }
    println!();

    let filter = ResultFilter::new(1.0, 0.05);
    for (cluster, table) in &results.tables {
        println!("=== Cluster {} ===\n", cluster);
        println!("{}", table.summary());

        let hits = filter_results(table, &filter);
        println!(
            "{:<12} {:>8} {:>8} {:>12} {:>12}",
            "Gene", "logFC", "logCPM", "p-value", "p-adj"
        );
        println!("{}", "-".repeat(56));
        for row in hits.iter().take(10) {
            println!(
                "{:<12} {:>8.3} {:>8.2} {:>12.2e} {:>12.2e}",
                row.gene_id, row.log_fc, row.log_cpm, row.p_value, row.p_adj
            );
        }
        println!();
    }

    println!("=== Analysis Configuration (YAML) ===\n");
    println!("{}", analysis.to_config().to_yaml()?);

    Ok(())
}

/// Create example cells with known effects.
///
/// Cluster `Mono` responds strongly to stimulation, `T` weakly, and `DC`
/// lacks cells in two stimulated samples so it cannot be tested.
fn create_example_data() -> Result<(CellSet, SampleMetadata)> {
    let n_genes = 40;
    let mut seed = 12345u64;

    let rand_uniform = |s: &mut u64| -> f64 {
        *s = s.wrapping_mul(1103515245).wrapping_add(12345);
        ((*s >> 16) & 0x7FFF) as f64 / 32768.0
    };

    let mut records = Vec::new();
    for (cluster, n_cells, effect) in [("Mono", 30, 4.0), ("T", 40, 1.5), ("DC", 8, 2.0)] {
        for (sample, group) in SAMPLES {
            let stimulated = group == "stim";
            let n = if cluster == "DC" && (sample == "stim1" || sample == "stim2") { 0 } else { n_cells };

            for c in 0..n {
                let counts: Vec<u64> = (0..n_genes)
                    .map(|g| {
                        let base = 2.0 + (g % 5) as f64;
                        // first five genes respond to stimulation
                        let mult = if stimulated && g < 5 { effect } else { 1.0 };
                        let noise = 0.5 + rand_uniform(&mut seed);
                        (base * mult * noise).round() as u64
                    })
                    .collect();
                records.push(CellRecord::new(
                    format!("{}_{}_{}", cluster, sample, c),
                    cluster,
                    sample,
                    counts,
                ));
            }
        }
    }

    let gene_ids = (0..n_genes)
        .map(|g| if g < 5 { format!("ISG_{}", g) } else { format!("gene_{}", g) })
        .collect();
    let cells = CellSet::new(gene_ids, records)?;

    let metadata = SampleMetadata::new(
        SAMPLES
            .iter()
            .map(|(sample, group)| SampleEntry::new(*sample, *group))
            .collect(),
    )?;

    Ok((cells, metadata))
}
