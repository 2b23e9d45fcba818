use std::env;
use std::process;

use domain::adapters::MemoryStore;
use domain::fixtures::seed_basic;
use domain::service::{MemberSearchCondition, MemberService};
use domain::Session;

fn print_usage() {
    eprintln!(
        "{}\n\nUsage:\n  domain search [--username <name>] [--team <name>] [--age <n>] [--age-goe <n>] [--age-loe <n>]\n  domain stats\n\nNotes:\n  - This demo CLI runs against an in-memory store seeded with two teams and four members.",
        domain::about()
    );
}

fn parse_age(flag: &str, raw: &str) -> Result<i32, String> {
    raw.parse()
        .map_err(|_| format!("{} expects an integer, got {:?}", flag, raw))
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1); // skip program name

    let Some(cmd) = args.next() else {
        print_usage();
        return Ok(());
    };

    let svc = MemberService::new(MemoryStore::new()).map_err(|e| e.to_string())?;
    seed_basic(&mut Session::new(svc.store())).map_err(|e| format!("seed failed: {}", e))?;

    match cmd.as_str() {
        "search" => {
            let mut cond = MemberSearchCondition::default();
            let rest: Vec<String> = args.collect();
            let mut i = 0;
            while i < rest.len() {
                let flag = rest[i].as_str();
                let Some(val) = rest.get(i + 1) else {
                    return Err(format!("{} requires a value", flag));
                };
                match flag {
                    "--username" => cond.username = Some(val.clone()),
                    "--team" => cond.team_name = Some(val.clone()),
                    "--age" => cond.age = Some(parse_age(flag, val)?),
                    "--age-goe" => cond.age_goe = Some(parse_age(flag, val)?),
                    "--age-loe" => cond.age_loe = Some(parse_age(flag, val)?),
                    unk => return Err(format!("unknown argument: {}", unk)),
                }
                i += 2;
            }

            let page = svc
                .search(&cond, 0, None, &[])
                .map_err(|e| format!("search failed: {}", e))?;
            for m in &page.items {
                println!(
                    "{:>3}  {:<10} {:>3}  {}",
                    m.member_id,
                    m.username.as_deref().unwrap_or("-"),
                    m.age,
                    m.team_name.as_deref().unwrap_or("-")
                );
            }
            println!("{} member(s)", page.total);
            Ok(())
        }
        "stats" => {
            let stats = svc
                .team_stats()
                .map_err(|e| format!("stats failed: {}", e))?;
            for s in stats {
                let avg = s
                    .average_age
                    .map_or_else(|| "-".to_string(), |a| format!("{:.1}", a));
                println!("{:<10} {:>3} members, avg age {}", s.team_name, s.member_count, avg);
            }
            Ok(())
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn main() {
    if let Err(msg) = run() {
        eprintln!("error: {}", msg);
        process::exit(1);
    }
}
