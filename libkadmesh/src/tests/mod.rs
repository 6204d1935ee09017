mod reservation_scenarios;
