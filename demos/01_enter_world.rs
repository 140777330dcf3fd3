//! Enter a fusion world and publish a shared field.
//!
//! Run one instance as master, then more as slaves:
//!
//! ```text
//! cargo run --example 01_enter_world master
//! cargo run --example 01_enter_world slave
//! ```

use fusion::arena::Arena;
use fusion::conf::FusionConfig;
use fusion::world::{EnterRole, World};

const ABI_VERSION: u32 = 1;

fn main() -> fusion::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let role = match std::env::args().nth(1).as_deref() {
        Some("master") => EnterRole::Master,
        Some("slave") => EnterRole::Slave,
        _ => EnterRole::Any,
    };

    let world = World::enter(0, ABI_VERSION, role, FusionConfig::default())?;
    println!(
        "entered world {} as {} (fusion id {})",
        world.index(),
        if world.is_master() { "master" } else { "slave" },
        world.fusion_id()
    );

    let (arena, outcome) = Arena::enter(
        &world,
        "demo",
        |arena| {
            let greeting = arena.world().main_pool().alloc_str("hello from the master")?;
            arena.add_shared_field("greeting", greeting)
        },
        |_| Ok(()),
    )?;
    println!("arena entered: {outcome:?}");

    let greeting = arena.get_shared_field("greeting")?;
    println!("shared field: {:?}", world.main_pool().read_str(greeting));

    let stats = world.main_pool().stats();
    println!(
        "pool: {} bytes used, {} bytes free, {} bytes core",
        stats.bytes_used, stats.bytes_free, stats.core
    );

    if world.is_master() {
        println!("master waiting 10s for slaves, then shutting down...");
        std::thread::sleep(std::time::Duration::from_secs(10));
    }

    arena.exit(
        |_, _| {
            println!("last one out, shutting the arena down");
            Ok(())
        },
        Some(|_: &Arena, _| {
            println!("leaving the arena");
            Ok(())
        }),
        false,
    )?;

    world.exit(false)
}
