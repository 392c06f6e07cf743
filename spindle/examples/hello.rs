use std::time::Instant;

use spindle::{MemoryRequirements, Splitter};

fn main() {
    let token = spindle::initialize(&MemoryRequirements::default());
    println!(
        "{} workers on {} ({})",
        token.num_owned_workers,
        spindle::processor_architecture_name(),
        spindle::num_system_threads(),
    );

    let mut data = vec![1u64; 4 << 20];

    let start = Instant::now();
    spindle::parallel_for(&mut data, Splitter::even_split(4 << 20, 4), |chunk| {
        for value in chunk {
            *value *= 3;
        }
    });
    println!("parallel_for over {} items took {:?}", data.len(), start.elapsed());

    let sum = spindle::parallel_reduce(
        &data,
        Splitter::even_split(4 << 20, 4),
        |chunk| chunk.iter().sum::<u64>(),
        |a, b| a + b,
    );
    println!("sum = {}", sum.unwrap());

    spindle::shutdown();
}
