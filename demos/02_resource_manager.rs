//! The consumer pattern: a resource manager as one Call handler plus one
//! Object.
//!
//! The master registers a call whose handler validates and performs every
//! mutation of a shared surface-count object; slaves never touch the
//! shared state directly, they execute operations through the call. This
//! is the shape every higher-level component of the platform takes.
//!
//! ```text
//! cargo run --example 02_resource_manager master
//! cargo run --example 02_resource_manager slave
//! ```

use fusion::arena::Arena;
use fusion::call::{Call, CallHandlerResult};
use fusion::conf::FusionConfig;
use fusion::object::{object_size, Object, ObjectPool};
use fusion::world::{EnterRole, World};

const ABI_VERSION: u32 = 1;

// Operations of the resource manager.
const OP_CREATE_CLIENT: i32 = 1;
const OP_ADD_SURFACE: i32 = 2;
const OP_REMOVE_SURFACE: i32 = 3;
const OP_UPDATE_SURFACE: i32 = 4;

#[repr(C)]
struct ManagerPayload {
    clients: u32,
    surfaces: u32,
    updates: u32,
}

fn main() -> fusion::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let role = match std::env::args().nth(1).as_deref() {
        Some("master") => EnterRole::Master,
        Some("slave") => EnterRole::Slave,
        _ => EnterRole::Any,
    };

    let world = World::enter(1, ABI_VERSION, role, FusionConfig::default())?;

    if world.is_master() {
        run_master(world)
    } else {
        run_slave(world)
    }
}

fn run_master(world: World) -> fusion::Result<()> {
    let pool = ObjectPool::create(
        &world,
        "resource managers",
        object_size(std::mem::size_of::<ManagerPayload>()),
        64,
        |_object, _zombie| println!("resource manager destroyed"),
    )?;

    let manager = pool.create_object()?;
    manager.activate()?;

    // All mutation goes through this handler, in the owning process.
    let manager_for_call = manager.clone();
    let call = Call::new(&world, move |_world, args| {
        let payload = unsafe { manager_for_call.payload_mut::<ManagerPayload>() };
        let result = match args.arg {
            OP_CREATE_CLIENT => {
                payload.clients += 1;
                payload.clients as i32
            }
            OP_ADD_SURFACE => {
                payload.surfaces += 1;
                payload.surfaces as i32
            }
            OP_REMOVE_SURFACE => {
                payload.surfaces = payload.surfaces.saturating_sub(1);
                payload.surfaces as i32
            }
            OP_UPDATE_SURFACE => {
                payload.updates += 1;
                payload.updates as i32
            }
            _ => -1,
        };
        CallHandlerResult::Return(result)
    })?;

    // Publish object and call through the bootstrap arena.
    let (arena, _) = Arena::enter(
        &world,
        "resource manager",
        |arena| {
            arena.add_shared_field("manager", manager.as_ptr().cast())?;
            let ids = arena
                .world()
                .main_pool()
                .alloc_value([call.id(), call.owner()])?;
            arena.add_shared_field("manager call", ids.cast())
        },
        |_| Ok(()),
    )?;

    println!("resource manager up; serving for 30s...");
    std::thread::sleep(std::time::Duration::from_secs(30));

    let payload = unsafe { manager.payload::<ManagerPayload>() };
    println!(
        "served {} clients, {} surfaces live, {} updates",
        payload.clients, payload.surfaces, payload.updates
    );

    arena.exit(
        |_, _| Ok(()),
        Some(|_: &Arena, _| Ok(())),
        false,
    )?;
    manager.unref()?;
    pool.destroy()?;
    world.exit(false)
}

fn run_slave(world: World) -> fusion::Result<()> {
    let (arena, _) = Arena::enter(
        &world,
        "resource manager",
        |_| panic!("master must be running"),
        |_| Ok(()),
    )?;

    let manager_ptr = arena.get_shared_field("manager")?;
    let ids_ptr = arena.get_shared_field("manager call")?;
    let [call_id, owner] = unsafe { *world.main_pool().get(ids_ptr.cast::<[u32; 2]>()) };

    let manager = unsafe { Object::from_ptr(world.clone(), manager_ptr.cast()) };
    manager.ref_up()?;

    let call = Call::init_from(&world, call_id, owner);

    let client = call.execute(OP_CREATE_CLIENT, &[])?;
    println!("registered as client #{client}");

    for i in 0..3 {
        let surfaces = call.execute(OP_ADD_SURFACE, &[])?;
        println!("added surface {i}; {surfaces} total");
    }
    call.execute(OP_UPDATE_SURFACE, &[])?;
    call.execute(OP_REMOVE_SURFACE, &[])?;

    // Reads can go straight to shared memory.
    let payload = unsafe { manager.payload::<ManagerPayload>() };
    println!("observed {} surfaces in shared state", payload.surfaces);

    manager.unref()?;
    arena.exit(
        |_, _| Ok(()),
        Some(|_: &Arena, _| Ok(())),
        false,
    )?;
    world.exit(false)
}
