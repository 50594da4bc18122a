//! Example: repository, views, state chains and a fixed-rate scheduler
//!
//! Run with: RUST_LOG=inferno=debug cargo run --example simulation

use std::thread;
use std::time::Duration;

use inferno::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone)]
struct Velocity {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone)]
struct Fuel(f32);

#[derive(Debug, Clone, Copy)]
enum Phase {
    Cruising,
    Stranded,
}

impl StateTag for Phase {
    fn ordinal(&self) -> u32 {
        *self as u32
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let repo = Repository::new(RepositoryConfig::new("simulation"))?;

    println!("Creating ships...");
    for i in 0..8 {
        let ship = repo.create((
            Position { x: 0.0, y: i as f32 },
            Velocity { x: 1.0 + i as f32, y: 0.0 },
            Fuel(2.0 + i as f32),
        ))?;
        ship.set_state(&Phase::Cruising);
    }
    repo.create((Position { x: -5.0, y: -5.0 },))?;
    println!("  {} entities in {} compositions", repo.size(), repo.composition_count());

    let scheduler = repo.create_scheduler()?;

    let world = repo.clone();
    scheduler.add_stage(move |ctx| {
        let dt = ctx.delta_seconds().min(0.1) as f32;
        for (pos, vel, _) in world.view::<(Position, Velocity)>().iter() {
            let vel = vel.get();
            let mut pos = pos.write();
            pos.x += vel.x * dt;
            pos.y += vel.y * dt;
        }
    });

    let world = repo.clone();
    let burn = task(move |ctx| {
        let dt = ctx.delta_seconds().min(0.1) as f32;
        for (fuel, ship) in world.view::<(Fuel,)>().with_state(&Phase::Cruising).iter() {
            let empty = {
                let mut fuel = fuel.write();
                fuel.0 -= dt * 4.0;
                fuel.0 <= 0.0
            };
            if empty {
                let _ = ship.remove::<(Velocity,)>();
                ship.set_state(&Phase::Stranded);
            }
        }
    });
    let world = repo.clone();
    let report = task(move |_| {
        let stranded = world.view::<(Fuel,)>().with_state(&Phase::Stranded).count();
        tracing::debug!(stranded, "fleet status");
    });
    scheduler.add_parallel_stage([burn, report]);

    println!("Running at 30 updates per second...");
    repo.update_at_rate(30);
    thread::sleep(Duration::from_millis(1500));
    repo.update_at_rate(0);

    println!("After {} frames:", scheduler.frame_count());
    for (pos, ship) in repo.view::<(Position,)>().include::<(Fuel,)>().iter() {
        let pos = pos.read();
        println!("  {:?} at ({:.1}, {:.1}) moving={}", ship.id(), pos.x, pos.y, ship.has::<Velocity>());
    }
    let stranded = repo.view::<(Fuel,)>().with_state(&Phase::Stranded).count();
    println!("  {stranded} ships out of fuel");

    repo.close();
    Ok(())
}
