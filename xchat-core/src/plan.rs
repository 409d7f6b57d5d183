//! Intent to data-query translation.

use xchat_chart::ChartConfig;
use xchat_infer::Intent;
use xchat_store::seed::{GEO_TABLE, SALES_TABLE};
use xchat_types::{AggOp, QueryDescriptor};

const PRODUCTS: [&str; 3] = ["Product A", "Product B", "Product C"];

/// How fetched rows turn into blocks.
#[derive(Clone, Debug, PartialEq)]
pub enum Render {
    Chart {
        chart_type: &'static str,
        config: ChartConfig,
    },
    Map {
        title: String,
    },
    Metrics,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataPlan {
    pub intent: Intent,
    pub descriptor: QueryDescriptor,
    pub render: Render,
}

impl DataPlan {
    /// Progress label shown while the output is rendered.
    pub fn render_label(&self) -> &'static str {
        match self.render {
            Render::Chart { .. } => "Rendering Stateless Chart [POST /v1/charts/generate]...",
            Render::Map { .. } => "Rendering Stateless Map [POST /v1/charts/generate]...",
            Render::Metrics => "Computing metrics...",
        }
    }

    /// Chart type the insight is requested for, if this plan gets one.
    pub fn insight_kind(&self) -> Option<&'static str> {
        match self.render {
            Render::Chart { chart_type, .. } => Some(chart_type),
            Render::Map { .. } => Some("map"),
            Render::Metrics => None,
        }
    }

    /// Progress label shown while the insight is generated.
    pub fn insight_label(&self) -> &'static str {
        match self.render {
            Render::Map { .. } => "Requesting Map Insight [Caching enabled]...",
            _ => "Requesting Chart Insight [Caching enabled]...",
        }
    }
}

/// `None` means no table query answers the intent: documents and the
/// general sub-agent take those prompts.
pub fn plan_for(intent: Intent) -> Option<DataPlan> {
    match intent {
        Intent::Trend => Some(DataPlan {
            intent,
            descriptor: QueryDescriptor::new(SALES_TABLE)
                .columns(std::iter::once("Date").chain(PRODUCTS)),
            render: Render::Chart {
                chart_type: "line",
                config: ChartConfig::titled("Sales Trend (Last 30 Days)")
                    .x("Date")
                    .y(PRODUCTS),
            },
        }),
        Intent::Geo => Some(DataPlan {
            intent,
            descriptor: QueryDescriptor::new(GEO_TABLE).columns(["lat", "lon"]),
            render: Render::Map {
                title: "User Distribution".into(),
            },
        }),
        Intent::Metrics => {
            let descriptor = PRODUCTS.iter().fold(
                QueryDescriptor::new(SALES_TABLE).columns(PRODUCTS),
                |d, p| d.aggregate(*p, AggOp::Avg),
            );
            Some(DataPlan {
                intent,
                descriptor,
                render: Render::Metrics,
            })
        }
        Intent::Rag | Intent::General => None,
    }
}
