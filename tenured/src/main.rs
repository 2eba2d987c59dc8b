use clap::Parser as ClapParser;
use std::process;

use heap::{
    CollectionStats, HeapSettings, ImageHeap, OldGeneration, RelocationEncoding,
    mark_from_roots,
};
use object::{
    Bytes, Slots, Value, bytes_allocation_size, init_bytes, init_slots,
    slots_allocation_size,
};

/// Payload bytes carried by every node.
const BLOB_LEN: usize = 24;
const IMAGE_HOLDERS: usize = 8;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Regions to fill before collecting
    #[arg(long, default_value_t = 16)]
    regions: usize,

    /// Region size in KiB (power of two)
    #[arg(long, default_value_t = 128)]
    region_size: usize,

    /// Share of nodes that stay reachable
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(0..=100))]
    live_percent: u64,

    /// Seed for the heap shape
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    /// Use 8-byte relocation records
    #[arg(long)]
    narrow: bool,

    /// Sweep regions whose fragmentation is below region_size / divisor
    #[arg(long, default_value_t = 16)]
    sweep_divisor: usize,

    /// Log every region decision
    #[arg(long, short)]
    verbose: bool,
}

/// Deterministic pseudo random numbers.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// A node is a slots object: field 0 holds its id, field 1 the previous
/// reachable node, field 2 a bytes blob filled with the low id byte.
struct Graph {
    roots: Vec<Value>,
    live_ids: Vec<i64>,
    nodes: usize,
}

fn blob_byte(id: i64) -> u8 {
    (id & 0xff) as u8
}

fn build_graph(
    old: &mut OldGeneration,
    image: &mut ImageHeap,
    cli: &Cli,
) -> Result<Graph, heap::GcError> {
    let mut rng = Lcg(cli.seed);
    let budget = cli.regions * old.settings().layout().objects_size();
    let mut graph = Graph {
        roots: Vec::new(),
        live_ids: Vec::new(),
        nodes: 0,
    };
    let mut previous: Option<usize> = None;
    let mut id = 0i64;

    while old.space().used_bytes() < budget {
        let fields = 3 + rng.next() as usize % 4;
        let node = old.promote(slots_allocation_size(fields))?.as_ptr();
        let blob = old.promote(bytes_allocation_size(BLOB_LEN))?.as_ptr();

        // SAFETY: both allocations are fresh and large enough
        let node_slots: &Slots = unsafe { init_slots(node, fields) };
        let blob_bytes: &Bytes = unsafe { init_bytes(blob, BLOB_LEN) };
        // SAFETY: see above
        unsafe {
            blob_bytes.payload_mut().fill(blob_byte(id));
            node_slots.set_field(0, Value::from_i64(id));
            node_slots.set_field(2, Value::from_ptr(blob));
            if let Some(prev) = previous {
                node_slots.set_field(1, Value::from_addr(prev));
            }
        }

        if rng.next() % 100 < cli.live_percent {
            previous = Some(node as usize);
            graph.live_ids.push(id);
            if rng.next() % 16 == 0 {
                graph.roots.push(Value::from_ptr(node));
            }
            if rng.next() % 64 == 0 && image_holder_count(image) < IMAGE_HOLDERS {
                add_image_holder(image, node as usize);
            }
        }
        graph.nodes += 1;
        id += 1;
    }

    // The newest live node reaches every other live node.
    if let Some(last) = previous {
        graph.roots.push(Value::from_addr(last));
    }
    Ok(graph)
}

fn image_holder_count(image: &ImageHeap) -> usize {
    (image.top() - image.start()) / slots_allocation_size(1)
}

fn add_image_holder(image: &mut ImageHeap, node: usize) {
    let Some(ptr) = image.allocate(slots_allocation_size(1)) else {
        return;
    };
    // SAFETY: fresh image allocation
    let holder = unsafe { init_slots(ptr.as_ptr(), 1) };
    // SAFETY: one field
    unsafe { holder.set_field(0, Value::from_addr(node)) };
}

/// Reads a node's id and checks its blob.
fn check_node(node: usize) -> Result<i64, String> {
    // SAFETY: node is reachable from a fixed root
    let slots = unsafe { &*(node as *const Slots) };
    // SAFETY: nodes have at least three fields
    let (id, blob) = unsafe { (slots.field(0), slots.field(2)) };
    if !id.is_fixnum() || !blob.is_ref() {
        return Err(format!("node 0x{node:x} is corrupt"));
    }
    // SAFETY: checked above
    let id = unsafe { id.to_i64() };
    // SAFETY: field 2 always holds a blob
    let payload = unsafe { (*(blob.as_ptr() as *const Bytes)).payload() };
    if payload.len() != BLOB_LEN || payload.iter().any(|&b| b != blob_byte(id)) {
        return Err(format!("blob of node {id} is corrupt"));
    }
    Ok(id)
}

/// Walks the chain from the newest root and compares the ids it finds with
/// the ones that were meant to survive.
fn verify(graph: &Graph, image: &ImageHeap) -> Result<(), String> {
    let Some(last) = graph.roots.last() else {
        return if graph.live_ids.is_empty() {
            Ok(())
        } else {
            Err("live nodes without roots".into())
        };
    };

    let mut found = Vec::new();
    let mut node = last.addr();
    loop {
        found.push(check_node(node)?);
        // SAFETY: nodes have at least three fields
        let link = unsafe { (*(node as *const Slots)).field(1) };
        if !link.is_ref() {
            break;
        }
        node = link.addr();
    }
    found.reverse();
    if found != graph.live_ids {
        return Err(format!(
            "expected {} live nodes, reached {}",
            graph.live_ids.len(),
            found.len()
        ));
    }

    for root in &graph.roots {
        check_node(root.addr())?;
    }
    let mut result = Ok(());
    // SAFETY: image holders are slots objects
    unsafe {
        image.walk_objects(|holder| {
            let value = (*(holder as *const Slots)).field(0);
            if result.is_ok() {
                result = check_node(value.addr()).map(drop);
            }
        })
    };
    result
}

fn print_stats(stats: &CollectionStats, old: &OldGeneration, graph: &Graph) {
    println!("nodes allocated:      {}", graph.nodes);
    println!("nodes live:           {}", graph.live_ids.len());
    println!("roots:                {}", graph.roots.len());
    println!("regions compacted:    {}", stats.regions_compacted);
    println!("regions swept:        {}", stats.regions_swept);
    println!("regions released:     {}", stats.regions_released);
    println!("regions remaining:    {}", old.space().region_count());
    println!("live bytes:           {}", stats.live_bytes);
    println!("gap bytes:            {}", stats.gap_bytes);
    println!("bytes copied:         {}", stats.bytes_copied);
    println!("filler bytes:         {}", stats.filler_bytes);
    println!("references fixed:     {}", stats.references_fixed);
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let region_size = cli.region_size * 1024;
    let settings = HeapSettings {
        // Twice what gets filled, so promotion never runs dry.
        heap_size: (cli.regions.max(1) * 2) * region_size,
        region_size,
        sweep_divisor: cli.sweep_divisor,
        large_size: (region_size / 4).max(object::MIN_OBJECT_SIZE),
        encoding: if cli.narrow {
            RelocationEncoding::Narrow
        } else {
            RelocationEncoding::Wide
        },
        ..Default::default()
    };

    let mut old = match OldGeneration::new(settings) {
        Ok(old) => old,
        Err(err) => {
            eprintln!("Invalid heap settings: {err}");
            process::exit(1);
        }
    };
    let Some(mut image) = ImageHeap::new(IMAGE_HOLDERS * slots_allocation_size(1), 512) else {
        eprintln!("Could not map the image heap");
        process::exit(1);
    };

    let mut graph = match build_graph(&mut old, &mut image, &cli) {
        Ok(graph) => graph,
        Err(err) => {
            eprintln!("Error building the heap: {err}");
            process::exit(1);
        }
    };
    log::info!(
        "built {} nodes in {} regions, {} live",
        graph.nodes,
        old.space().region_count(),
        graph.live_ids.len()
    );

    let marked = mark_from_roots(old.space(), &mut graph.roots, Some(&image));
    log::info!("marked {} objects, {} bytes", marked.objects, marked.bytes);

    let stats = old.collect(&mut graph.roots, Some(&mut image));

    if let Err(err) = verify(&graph, &image) {
        eprintln!("Verification failed: {err}");
        process::exit(1);
    }
    print_stats(&stats, &old, &graph);
}
