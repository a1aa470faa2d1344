use std::error::Error;
use std::io::Write;

use crate::cli::{servers_for_bot, CliContext};
use crate::mcp::{
    RegistryTimeouts, ResourceDescriptor, ResourceTemplateDescriptor, ServerStatus,
    ToolDescriptor, ToolRegistry,
};

pub async fn list_servers<W: Write>(
    context: &CliContext,
    bot_id: Option<&str>,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    let bot = context.load_bot(bot_id).await?;
    let servers = servers_for_bot(&context.config, bot.as_ref());
    if servers.is_empty() {
        writeln!(out, "No MCP servers configured.")?;
        return Ok(());
    }

    let registry = ToolRegistry::new(RegistryTimeouts::from(&context.config.turn));
    registry.connect_all(&servers).await;
    let report = render_report(
        &registry.server_statuses(),
        &registry.tools(),
        &registry.resources(),
        &registry.resource_templates(),
    );
    registry.close_all().await;

    write!(out, "{report}")?;
    Ok(())
}

/// One block per server: its state, then its tools, resources and
/// resource templates.
pub fn render_report(
    statuses: &[ServerStatus],
    tools: &[ToolDescriptor],
    resources: &[ResourceDescriptor],
    templates: &[ResourceTemplateDescriptor],
) -> String {
    let mut report = String::new();
    for status in statuses {
        report.push_str(&format!("{} ({}): {}", status.server_id, status.label, status.state));
        if let Some(info) = &status.server_info {
            report.push_str(&format!(
                "  [{} {}, protocol {}]",
                info.name, info.version, info.protocol_version
            ));
        }
        report.push('\n');
        if let Some(err) = &status.last_error {
            report.push_str(&format!("  error: {err}\n"));
        }

        for tool in tools.iter().filter(|tool| tool.server_id == status.server_id) {
            match &tool.description {
                Some(description) => {
                    report.push_str(&format!("  tool {}: {description}\n", tool.qualified_name))
                }
                None => report.push_str(&format!("  tool {}\n", tool.qualified_name)),
            }
        }
        for resource in resources
            .iter()
            .filter(|resource| resource.server_id == status.server_id)
        {
            report.push_str(&format!("  resource {} ({})\n", resource.uri, resource.name));
        }
        for template in templates
            .iter()
            .filter(|template| template.server_id == status.server_id)
        {
            report.push_str(&format!(
                "  template {} ({})\n",
                template.uri_template, template.name
            ));
        }
    }
    report
}
